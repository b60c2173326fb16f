use std::future::Future;

use crate::message::{Request, Response};

/// What the hook wants done with an inbound request.
pub enum RequestDecision {
    /// Forward the (possibly modified) request upstream.
    Forward,
    /// Answer the client directly without contacting an upstream.
    Respond(Response),
    /// Abort the session without answering.
    Drop,
}

/// Interception seam between the session loop and the rewrite engine.
///
/// `modify_response` receives the URL as the client sent it, before any
/// request-side URL rewrites, so response rules match against what the
/// client asked for.
pub trait ModifyHook: Send + Sync + 'static {
    fn modify_request(
        &self,
        request: &mut Request,
    ) -> impl Future<Output = RequestDecision> + Send;

    fn modify_response(
        &self,
        original_url: &str,
        client_ip: &str,
        response: &mut Response,
    ) -> impl Future<Output = ()> + Send;
}

/// Hook that forwards everything untouched.
pub struct PassthroughHook;

impl ModifyHook for PassthroughHook {
    async fn modify_request(&self, _request: &mut Request) -> RequestDecision {
        RequestDecision::Forward
    }

    async fn modify_response(
        &self,
        _original_url: &str,
        _client_ip: &str,
        _response: &mut Response,
    ) {
    }
}
