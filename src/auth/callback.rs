//! One-shot loopback listener for the SSO authorization redirect
//!
//! The provider redirects the user's browser to
//! `http://127.0.0.1:<port>/callback?code=...&state=...` (or `error=...` on
//! denial). The listener answers exactly one callback request, hands the
//! parameters to the login flow, and exits. Lifetime and cancellation are
//! owned by the session manager, which aborts the task when a flow is
//! superseded or times out.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use url::Url;

use crate::error::AuthError;

/// Parameters delivered by the provider redirect
#[derive(Debug, Clone)]
pub struct AuthCallback {
    pub code: String,
    pub state: String,
}

const SUCCESS_PAGE: &str = "<!DOCTYPE html><html><head><title>EVA</title></head>\
<body><h2>Login complete</h2><p>You can close this window and return to EVA.</p></body></html>";

const FAILURE_PAGE: &str = "<!DOCTYPE html><html><head><title>EVA</title></head>\
<body><h2>Login failed</h2><p>You can close this window and try again in EVA.</p></body></html>";

/// Accept connections until one carries the callback, then deliver its
/// parameters and exit.
///
/// Stray requests (favicon probes and the like) get a 404 and the listener
/// keeps waiting.
pub async fn serve_once(
    listener: TcpListener,
    reply: oneshot::Sender<Result<AuthCallback, AuthError>>,
) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                let _ = reply.send(Err(AuthError::Listener(e.to_string())));
                return;
            }
        };

        match handle_connection(stream).await {
            Some(result) => {
                let _ = reply.send(result);
                return;
            }
            None => continue,
        }
    }
}

/// Returns `None` when the request was not the callback and the listener
/// should keep waiting.
async fn handle_connection(stream: TcpStream) -> Option<Result<AuthCallback, AuthError>> {
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await.is_err() {
        return None;
    }

    // "GET /callback?code=...&state=... HTTP/1.1"
    let path = match request_line.split_whitespace().nth(1) {
        Some(path) => path.to_string(),
        None => return None,
    };

    if !path.starts_with("/callback") {
        let mut stream = reader.into_inner();
        let _ = stream
            .write_all(b"HTTP/1.1 404 Not Found\r\nConnection: close\r\n\r\n")
            .await;
        return None;
    }

    let result = parse_callback_path(&path);
    let page = if result.is_ok() {
        SUCCESS_PAGE
    } else {
        FAILURE_PAGE
    };

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        page.len(),
        page
    );
    let mut stream = reader.into_inner();
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;

    Some(result)
}

/// Extract `code`/`state` (or a provider `error`) from the callback path
pub fn parse_callback_path(path_and_query: &str) -> Result<AuthCallback, AuthError> {
    let url = Url::parse(&format!("http://127.0.0.1{}", path_and_query))
        .map_err(|e| AuthError::BadCallback(e.to_string()))?;

    let mut code = None;
    let mut state = None;
    let mut error = None;
    let mut error_description = None;

    for (k, v) in url.query_pairs() {
        match k.as_ref() {
            "code" => code = Some(v.into_owned()),
            "state" => state = Some(v.into_owned()),
            "error" => error = Some(v.into_owned()),
            "error_description" => error_description = Some(v.into_owned()),
            _ => {}
        }
    }

    if let Some(error) = error {
        return Err(AuthError::Denied(error_description.unwrap_or(error)));
    }

    match (code, state) {
        (Some(code), Some(state)) => Ok(AuthCallback { code, state }),
        _ => Err(AuthError::BadCallback(
            "callback missing code or state parameter".into(),
        )),
    }
}
