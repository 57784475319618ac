use serde::{Deserialize, Serialize};
use std::fmt;

use crate::graph::ValueType;

/// Input/output keys shared between executors, the graph validator and the DSL.
pub mod keys {
    pub const USER_CHAT_INPUT: &str = "userChatInput";
    pub const HISTORY: &str = "history";
    pub const MODEL: &str = "model";
    pub const SYSTEM_PROMPT: &str = "systemPrompt";
    pub const TEMPERATURE: &str = "temperature";
    pub const MAX_TOKEN: &str = "maxToken";
    pub const QUOTE_QA: &str = "quoteQA";
    pub const IS_RESPONSE_ANSWER_TEXT: &str = "isResponseAnswerText";
    pub const ANSWER_TEXT: &str = "answerText";
    pub const TEXT: &str = "text";
    pub const ERROR: &str = "error";

    pub const DATASETS: &str = "datasets";
    pub const SIMILARITY: &str = "similarity";
    pub const LIMIT: &str = "limit";
    pub const SEARCH_FILTERS: &str = "filters";

    pub const IF_ELSE_LIST: &str = "ifElseList";
    pub const IF_ELSE_RESULT: &str = "ifElseResult";

    pub const LOOP_INPUT_ARRAY: &str = "loopInputArray";
    pub const LOOP_BREAK_CONDITION: &str = "loopBreakCondition";
    pub const LOOP_ARRAY: &str = "loopArray";
    pub const LOOP_START_INPUT: &str = "loopStartInput";
    pub const LOOP_START_INDEX: &str = "loopStartIndex";
    pub const LOOP_END_INPUT: &str = "loopEndInput";

    pub const AGENTS: &str = "agents";
    pub const CQ_RESULT: &str = "cqResult";

    pub const UPDATE_LIST: &str = "updateList";

    pub const CODE: &str = "code";
    pub const CODE_TYPE: &str = "codeType";
    pub const RAW_RESPONSE: &str = "rawResponse";

    pub const HTTP_METHOD: &str = "system_httpMethod";
    pub const HTTP_URL: &str = "system_httpReqUrl";
    pub const HTTP_HEADER: &str = "system_httpHeader";
    pub const HTTP_PARAMS: &str = "system_httpParams";
    pub const HTTP_JSON_BODY: &str = "system_httpJsonBody";
    pub const HTTP_TIMEOUT: &str = "system_httpTimeout";
    pub const HTTP_RETRIES: &str = "system_httpRetries";
    pub const HTTP_RAW_RESPONSE: &str = "httpRawResponse";

    pub const PLUGIN_ID: &str = "pluginId";

    pub const DESCRIPTION: &str = "description";
    pub const USER_SELECT_OPTIONS: &str = "userSelectOptions";
    pub const SELECT_RESULT: &str = "selectResult";
    pub const USER_INPUT_FORMS: &str = "userInputForms";
    pub const FORM_INPUT_RESULT: &str = "formInputResult";

    pub const TEXTAREA_INPUT: &str = "system_textareaInput";
    pub const TEXT_OUTPUT: &str = "system_text";
}

/// Well-known edge handles.
pub mod handles {
    pub const SOURCE: &str = "source";
    pub const TARGET: &str = "target";
    pub const ERROR: &str = "error";
    pub const SELECTED_TOOLS: &str = "selectedTools";
    pub const IF: &str = "IF";
    pub const ELSE: &str = "ELSE";

    /// Handle of the `index`-th branch of an if-else list (0 is `IF`).
    pub fn if_else_branch(index: usize) -> String {
        if index == 0 {
            IF.to_string()
        } else {
            format!("ELSE IF {}", index)
        }
    }
}

/// Closed set of node types understood by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    #[serde(rename = "workflowStart")]
    WorkflowStart,
    #[serde(rename = "answerNode")]
    Answer,
    #[serde(rename = "ifElseNode")]
    IfElse,
    #[serde(rename = "loop")]
    Loop,
    #[serde(rename = "loopStart")]
    LoopStart,
    #[serde(rename = "loopEnd")]
    LoopEnd,
    #[serde(rename = "datasetSearchNode")]
    DatasetSearch,
    #[serde(rename = "datasetConcatNode")]
    DatasetConcat,
    #[serde(rename = "chatNode")]
    ChatNode,
    #[serde(rename = "tools")]
    ToolCall,
    #[serde(rename = "stopTool")]
    StopTool,
    #[serde(rename = "classifyQuestion")]
    ClassifyQuestion,
    #[serde(rename = "variableUpdate")]
    VariableUpdate,
    #[serde(rename = "code")]
    Code,
    #[serde(rename = "httpRequest468")]
    HttpRequest,
    #[serde(rename = "pluginModule")]
    PluginModule,
    #[serde(rename = "pluginInput")]
    PluginInput,
    #[serde(rename = "pluginOutput")]
    PluginOutput,
    #[serde(rename = "userSelect")]
    UserSelect,
    #[serde(rename = "formInput")]
    FormInput,
    #[serde(rename = "textEditor")]
    TextEditor,
}

/// Static port declaration.
#[derive(Debug, Clone, Copy)]
pub struct PortSpec {
    pub key: &'static str,
    pub value_type: ValueType,
    pub required: bool,
}

const fn port(key: &'static str, value_type: ValueType, required: bool) -> PortSpec {
    PortSpec {
        key,
        value_type,
        required,
    }
}

/// How a node selects its outgoing edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branching {
    /// Every outgoing edge becomes active.
    None,
    /// Handles are derived from the node's own configuration.
    Dynamic,
}

/// Per-type contract consulted by the graph validator and the scheduler.
#[derive(Debug, Clone, Copy)]
pub struct NodeContract {
    pub inputs: &'static [PortSpec],
    pub outputs: &'static [PortSpec],
    pub branching: Branching,
    /// Runs unconditionally at the start of its scope.
    pub entry: bool,
    /// Appends a usage record on success.
    pub reports_usage: bool,
    /// Failure degrades to default outputs instead of aborting the run.
    pub fault_tolerant: bool,
    /// May write global variables and other nodes' outputs.
    pub writes_variables: bool,
    /// May pause the run waiting for a user reply.
    pub interactive: bool,
    /// Owns child nodes (`parentNodeId`) dispatched in a nested scope.
    pub container: bool,
}

const BASE: NodeContract = NodeContract {
    inputs: &[],
    outputs: &[],
    branching: Branching::None,
    entry: false,
    reports_usage: false,
    fault_tolerant: false,
    writes_variables: false,
    interactive: false,
    container: false,
};

use keys::*;
use ValueType as T;

const LLM_INPUTS: &[PortSpec] = &[
    port(MODEL, T::String, true),
    port(SYSTEM_PROMPT, T::String, false),
    port(HISTORY, T::Any, false),
    port(QUOTE_QA, T::DatasetQuote, false),
    port(USER_CHAT_INPUT, T::String, true),
    port(TEMPERATURE, T::Number, false),
    port(MAX_TOKEN, T::Number, false),
    port(IS_RESPONSE_ANSWER_TEXT, T::Boolean, false),
];

const START_OUTPUTS: &[PortSpec] = &[port(USER_CHAT_INPUT, T::String, true)];

const ANSWER_INPUTS: &[PortSpec] = &[port(TEXT, T::String, false)];
const ANSWER_OUTPUTS: &[PortSpec] = &[port(ANSWER_TEXT, T::String, false)];

const IF_ELSE_INPUTS: &[PortSpec] = &[port(IF_ELSE_LIST, T::Any, true)];
const IF_ELSE_OUTPUTS: &[PortSpec] = &[port(IF_ELSE_RESULT, T::String, false)];

const LOOP_INPUTS: &[PortSpec] = &[
    port(LOOP_INPUT_ARRAY, T::ArrayAny, false),
    port(LOOP_BREAK_CONDITION, T::Any, false),
];
const LOOP_OUTPUTS: &[PortSpec] = &[port(LOOP_ARRAY, T::ArrayAny, true)];
const LOOP_START_OUTPUTS: &[PortSpec] = &[
    port(LOOP_START_INPUT, T::Any, false),
    port(LOOP_START_INDEX, T::Number, false),
];
const LOOP_END_PORTS: &[PortSpec] = &[port(LOOP_END_INPUT, T::Any, false)];

const DATASET_SEARCH_INPUTS: &[PortSpec] = &[
    port(DATASETS, T::ArrayAny, true),
    port(USER_CHAT_INPUT, T::String, true),
    port(SIMILARITY, T::Number, false),
    port(LIMIT, T::Number, false),
    port(SEARCH_FILTERS, T::Object, false),
];
const DATASET_CONCAT_INPUTS: &[PortSpec] = &[port(LIMIT, T::Number, false)];
const QUOTE_OUTPUTS: &[PortSpec] = &[port(QUOTE_QA, T::DatasetQuote, true)];

const CHAT_OUTPUTS: &[PortSpec] = &[
    port(ANSWER_TEXT, T::String, true),
    port(HISTORY, T::ChatHistory, false),
];
const TOOL_CALL_OUTPUTS: &[PortSpec] = &[port(ANSWER_TEXT, T::String, true)];

const CLASSIFY_INPUTS: &[PortSpec] = &[
    port(MODEL, T::String, true),
    port(SYSTEM_PROMPT, T::String, false),
    port(HISTORY, T::Any, false),
    port(USER_CHAT_INPUT, T::String, true),
    port(AGENTS, T::ArrayObject, true),
];
const CLASSIFY_OUTPUTS: &[PortSpec] = &[port(CQ_RESULT, T::String, false)];

const VARIABLE_UPDATE_INPUTS: &[PortSpec] = &[port(UPDATE_LIST, T::ArrayObject, true)];

const CODE_INPUTS: &[PortSpec] = &[port(CODE, T::String, true), port(CODE_TYPE, T::String, false)];
const CODE_OUTPUTS: &[PortSpec] = &[port(RAW_RESPONSE, T::Object, false)];

const HTTP_INPUTS: &[PortSpec] = &[
    port(HTTP_METHOD, T::String, false),
    port(HTTP_URL, T::String, true),
    port(HTTP_HEADER, T::Any, false),
    port(HTTP_PARAMS, T::Any, false),
    port(HTTP_JSON_BODY, T::String, false),
    port(HTTP_TIMEOUT, T::Number, false),
    port(HTTP_RETRIES, T::Number, false),
];
const HTTP_OUTPUTS: &[PortSpec] = &[
    port(HTTP_RAW_RESPONSE, T::Any, false),
    port(ERROR, T::String, false),
];

const PLUGIN_INPUTS: &[PortSpec] = &[port(PLUGIN_ID, T::String, true)];

const USER_SELECT_INPUTS: &[PortSpec] = &[
    port(DESCRIPTION, T::String, false),
    port(USER_SELECT_OPTIONS, T::ArrayObject, true),
];
const USER_SELECT_OUTPUTS: &[PortSpec] = &[port(SELECT_RESULT, T::String, false)];

const FORM_INPUTS: &[PortSpec] = &[
    port(DESCRIPTION, T::String, false),
    port(USER_INPUT_FORMS, T::ArrayObject, true),
];
const FORM_OUTPUTS: &[PortSpec] = &[port(FORM_INPUT_RESULT, T::Object, false)];

const TEXT_EDITOR_INPUTS: &[PortSpec] = &[port(TEXTAREA_INPUT, T::String, false)];
const TEXT_EDITOR_OUTPUTS: &[PortSpec] = &[port(TEXT_OUTPUT, T::String, false)];

impl NodeType {
    pub const ALL: [NodeType; 21] = [
        NodeType::WorkflowStart,
        NodeType::Answer,
        NodeType::IfElse,
        NodeType::Loop,
        NodeType::LoopStart,
        NodeType::LoopEnd,
        NodeType::DatasetSearch,
        NodeType::DatasetConcat,
        NodeType::ChatNode,
        NodeType::ToolCall,
        NodeType::StopTool,
        NodeType::ClassifyQuestion,
        NodeType::VariableUpdate,
        NodeType::Code,
        NodeType::HttpRequest,
        NodeType::PluginModule,
        NodeType::PluginInput,
        NodeType::PluginOutput,
        NodeType::UserSelect,
        NodeType::FormInput,
        NodeType::TextEditor,
    ];

    /// Wire name used in workflow documents.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::WorkflowStart => "workflowStart",
            NodeType::Answer => "answerNode",
            NodeType::IfElse => "ifElseNode",
            NodeType::Loop => "loop",
            NodeType::LoopStart => "loopStart",
            NodeType::LoopEnd => "loopEnd",
            NodeType::DatasetSearch => "datasetSearchNode",
            NodeType::DatasetConcat => "datasetConcatNode",
            NodeType::ChatNode => "chatNode",
            NodeType::ToolCall => "tools",
            NodeType::StopTool => "stopTool",
            NodeType::ClassifyQuestion => "classifyQuestion",
            NodeType::VariableUpdate => "variableUpdate",
            NodeType::Code => "code",
            NodeType::HttpRequest => "httpRequest468",
            NodeType::PluginModule => "pluginModule",
            NodeType::PluginInput => "pluginInput",
            NodeType::PluginOutput => "pluginOutput",
            NodeType::UserSelect => "userSelect",
            NodeType::FormInput => "formInput",
            NodeType::TextEditor => "textEditor",
        }
    }

    pub fn contract(&self) -> NodeContract {
        match self {
            NodeType::WorkflowStart => NodeContract {
                outputs: START_OUTPUTS,
                entry: true,
                ..BASE
            },
            NodeType::Answer => NodeContract {
                inputs: ANSWER_INPUTS,
                outputs: ANSWER_OUTPUTS,
                ..BASE
            },
            NodeType::IfElse => NodeContract {
                inputs: IF_ELSE_INPUTS,
                outputs: IF_ELSE_OUTPUTS,
                branching: Branching::Dynamic,
                reports_usage: true,
                ..BASE
            },
            NodeType::Loop => NodeContract {
                inputs: LOOP_INPUTS,
                outputs: LOOP_OUTPUTS,
                reports_usage: true,
                container: true,
                ..BASE
            },
            NodeType::LoopStart => NodeContract {
                outputs: LOOP_START_OUTPUTS,
                entry: true,
                ..BASE
            },
            NodeType::LoopEnd => NodeContract {
                inputs: LOOP_END_PORTS,
                outputs: LOOP_END_PORTS,
                ..BASE
            },
            NodeType::DatasetSearch => NodeContract {
                inputs: DATASET_SEARCH_INPUTS,
                outputs: QUOTE_OUTPUTS,
                reports_usage: true,
                ..BASE
            },
            NodeType::DatasetConcat => NodeContract {
                inputs: DATASET_CONCAT_INPUTS,
                outputs: QUOTE_OUTPUTS,
                reports_usage: true,
                fault_tolerant: true,
                ..BASE
            },
            NodeType::ChatNode => NodeContract {
                inputs: LLM_INPUTS,
                outputs: CHAT_OUTPUTS,
                reports_usage: true,
                ..BASE
            },
            NodeType::ToolCall => NodeContract {
                inputs: LLM_INPUTS,
                outputs: TOOL_CALL_OUTPUTS,
                reports_usage: true,
                ..BASE
            },
            NodeType::StopTool => BASE,
            NodeType::ClassifyQuestion => NodeContract {
                inputs: CLASSIFY_INPUTS,
                outputs: CLASSIFY_OUTPUTS,
                branching: Branching::Dynamic,
                reports_usage: true,
                ..BASE
            },
            NodeType::VariableUpdate => NodeContract {
                inputs: VARIABLE_UPDATE_INPUTS,
                reports_usage: true,
                writes_variables: true,
                ..BASE
            },
            NodeType::Code => NodeContract {
                inputs: CODE_INPUTS,
                outputs: CODE_OUTPUTS,
                reports_usage: true,
                ..BASE
            },
            NodeType::HttpRequest => NodeContract {
                inputs: HTTP_INPUTS,
                outputs: HTTP_OUTPUTS,
                reports_usage: true,
                fault_tolerant: true,
                ..BASE
            },
            NodeType::PluginModule => NodeContract {
                inputs: PLUGIN_INPUTS,
                reports_usage: true,
                ..BASE
            },
            NodeType::PluginInput => NodeContract { entry: true, ..BASE },
            NodeType::PluginOutput => BASE,
            NodeType::UserSelect => NodeContract {
                inputs: USER_SELECT_INPUTS,
                outputs: USER_SELECT_OUTPUTS,
                branching: Branching::Dynamic,
                reports_usage: true,
                interactive: true,
                ..BASE
            },
            NodeType::FormInput => NodeContract {
                inputs: FORM_INPUTS,
                outputs: FORM_OUTPUTS,
                reports_usage: true,
                interactive: true,
                ..BASE
            },
            NodeType::TextEditor => NodeContract {
                inputs: TEXT_EDITOR_INPUTS,
                outputs: TEXT_EDITOR_OUTPUTS,
                ..BASE
            },
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names_round_trip_through_serde() {
        for node_type in NodeType::ALL {
            let json = serde_json::to_string(&node_type).unwrap();
            assert_eq!(json, format!("\"{}\"", node_type.as_str()));
            let back: NodeType = serde_json::from_str(&json).unwrap();
            assert_eq!(back, node_type);
        }
    }

    #[test]
    fn test_entry_types() {
        let entries: Vec<_> = NodeType::ALL
            .iter()
            .filter(|t| t.contract().entry)
            .collect();
        assert_eq!(
            entries,
            vec![
                &NodeType::WorkflowStart,
                &NodeType::LoopStart,
                &NodeType::PluginInput
            ]
        );
    }

    #[test]
    fn test_usage_reporting_excludes_pass_through_nodes() {
        assert!(!NodeType::WorkflowStart.contract().reports_usage);
        assert!(!NodeType::Answer.contract().reports_usage);
        assert!(NodeType::DatasetSearch.contract().reports_usage);
        assert!(NodeType::ChatNode.contract().reports_usage);
    }

    #[test]
    fn test_contract_ports_outlive_the_contract() {
        fn ports(node_type: NodeType) -> &'static [PortSpec] {
            node_type.contract().inputs
        }
        let keys: Vec<_> = ports(NodeType::Loop).iter().map(|p| p.key).collect();
        assert_eq!(keys, vec![LOOP_INPUT_ARRAY, LOOP_BREAK_CONDITION]);
        assert!(ports(NodeType::HttpRequest)
            .iter()
            .any(|p| p.key == HTTP_URL && p.required));
        assert_eq!(
            NodeType::LoopEnd.contract().inputs[0].key,
            NodeType::LoopEnd.contract().outputs[0].key
        );
    }

    #[test]
    fn test_if_else_handles() {
        assert_eq!(handles::if_else_branch(0), "IF");
        assert_eq!(handles::if_else_branch(2), "ELSE IF 2");
    }
}
