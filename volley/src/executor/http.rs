use std::future::Future;

use reqwest::Client;
use typed_builder::TypedBuilder;

use super::Call;
use crate::{error::ExecutionError, outcome::Outcome, outcome::UnitParams};

/// A [`Call`] that POSTs the unit params as JSON to a fixed URL.
///
/// Any 2xx answer is a success unless a `success_marker` is set, in which
/// case the response body must also contain it. Non-2xx answers are failures,
/// transport problems are errors.
///
/// Build the client once and share it. Creating a client per unit throws
/// away the connection pool.
///
/// ```rust
/// use volley::executor::HttpCall;
///
/// let call = HttpCall::builder()
///     .url("http://localhost:3000/ingest")
///     .success_marker("\"ok\":true")
///     .build();
/// # let _ = call;
/// ```
#[derive(Debug, Clone, TypedBuilder)]
pub struct HttpCall {
    #[builder(default)]
    pub client: Client,
    #[builder(setter(into))]
    pub url: String,
    /// Substring the body must contain for the answer to count as a success.
    #[builder(default, setter(strip_option, into))]
    pub success_marker: Option<String>,
}

impl<P: UnitParams> Call<P> for HttpCall {
    fn call(&self, params: &P) -> impl Future<Output = Outcome> + Send {
        let request = self.client.post(&self.url).json(params);
        let marker = self.success_marker.clone();
        async move {
            let response = match request.send().await {
                Ok(r) => r,
                Err(e) => return ExecutionError::Transport(e.to_string()).into(),
            };
            if !response.status().is_success() {
                return Outcome::Failure;
            }
            let Some(marker) = marker else {
                return Outcome::Success;
            };
            match response.text().await {
                Ok(body) if body.contains(&marker) => Outcome::Success,
                Ok(_) => Outcome::Failure,
                Err(e) => ExecutionError::MalformedResponse(e.to_string()).into(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    /// Answer exactly one request with a canned response and return the URL.
    async fn serve_once(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        format!("http://{addr}/")
    }

    /// Drain headers plus a `content-length` body so the client sees a clean exchange.
    async fn read_request(socket: &mut tokio::net::TcpStream) {
        let mut request = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                return;
            }
            request.extend_from_slice(&chunk[..n]);
            let Some(end) = request.windows(4).position(|w| w == b"\r\n\r\n") else {
                continue;
            };
            let headers = String::from_utf8_lossy(&request[..end]).to_ascii_lowercase();
            let length = headers
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if request.len() >= end + 4 + length {
                return;
            }
        }
    }

    async fn call(http: &HttpCall) -> Outcome {
        Call::<serde_json::Value>::call(http, &serde_json::json!({"n": 1})).await
    }

    #[tokio::test]
    async fn non_2xx_is_a_failure() {
        let url = serve_once("503 Service Unavailable", "{}").await;
        let http = HttpCall::builder().url(url).build();

        assert_eq!(call(&http).await, Outcome::Failure);
    }

    #[tokio::test]
    async fn any_2xx_without_marker_is_a_success() {
        let url = serve_once("200 OK", "{\"ok\":false}").await;
        let http = HttpCall::builder().url(url).build();

        assert_eq!(call(&http).await, Outcome::Success);
    }

    #[tokio::test]
    async fn marker_in_body_is_a_success() {
        let url = serve_once("200 OK", "{\"ok\":true,\"id\":7}").await;
        let http = HttpCall::builder()
            .url(url)
            .success_marker("\"ok\":true")
            .build();

        assert_eq!(call(&http).await, Outcome::Success);
    }

    #[tokio::test]
    async fn missing_marker_is_a_failure() {
        let url = serve_once("200 OK", "{\"ok\":false}").await;
        let http = HttpCall::builder()
            .url(url)
            .success_marker("\"ok\":true")
            .build();

        assert_eq!(call(&http).await, Outcome::Failure);
    }

    #[tokio::test]
    async fn unreachable_host_is_a_transport_error() {
        // Port 9 (discard) is closed on any sane test host.
        let call = HttpCall::builder().url("http://127.0.0.1:9/").build();

        let outcome = Call::<serde_json::Value>::call(&call, &serde_json::json!({"n": 1})).await;

        assert!(
            matches!(outcome, Outcome::Error(ExecutionError::Transport(_))),
            "unexpected outcome: {outcome:?}"
        );
    }
}
