use serde::{Deserialize, Serialize};

use crate::failure::Failure;
use crate::ids::{CallId, FunctionId};
use crate::value::{Args, Kwargs, Value};

/// Message type tag separating RPC traffic from anything else on the transport
pub const MESSAGE_TYPE: &str = "constellation.rpc";

/// RPC wire message
///
/// Every message carries the call id it belongs to. A call produces at most
/// one `CallReturn` or `CallFail`; a `CallCancel` arriving after either is a
/// no-op on the receiving side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Call {
        call_id: CallId,
        function_id: FunctionId,
        args: Args,
        kwargs: Kwargs,
    },
    CallReturn {
        call_id: CallId,
        value: Value,
    },
    CallFail {
        call_id: CallId,
        failure: Failure,
    },
    CallCancel {
        call_id: CallId,
    },
}

impl Message {
    pub fn call_id(&self) -> CallId {
        match self {
            Message::Call { call_id, .. }
            | Message::CallReturn { call_id, .. }
            | Message::CallFail { call_id, .. }
            | Message::CallCancel { call_id } => *call_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Call { .. } => "call",
            Message::CallReturn { .. } => "call_return",
            Message::CallFail { .. } => "call_fail",
            Message::CallCancel { .. } => "call_cancel",
        }
    }
}
