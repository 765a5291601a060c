use crate::rpc::{ClientInfo, RpcResult, Value};

/// A locally registered RPC method.
///
/// Invocations run on the blocking pool, so implementations may block.
pub trait RpcMethod: Send + Sync + 'static {
    fn invoke(&self, client: &ClientInfo, params: Vec<Value>) -> RpcResult;
}

impl<F> RpcMethod for F
where
    F: Fn(&ClientInfo, Vec<Value>) -> RpcResult + Send + Sync + 'static,
{
    fn invoke(&self, client: &ClientInfo, params: Vec<Value>) -> RpcResult {
        self(client, params)
    }
}
