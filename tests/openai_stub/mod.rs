use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::Value;

/// One request seen by the stub, reduced to what the tests route on.
#[derive(Debug, Clone)]
pub struct StubRequest {
    pub model: String,
    /// The `TASK: ...` line of the last input message, without the prefix.
    pub task: String,
    /// Content of the last input message.
    pub prompt: String,
    /// Every input message, joined.
    pub conversation: String,
}

impl StubRequest {
    fn from_body(body: &Value) -> Self {
        let contents = body
            .get("input")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.get("content").and_then(|v| v.as_str()))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let prompt = contents.last().copied().unwrap_or_default().to_owned();
        let conversation = contents.join("\n\n");
        let task = prompt
            .lines()
            .find_map(|line| line.strip_prefix("TASK: "))
            .unwrap_or_default()
            .trim()
            .to_owned();
        Self {
            model: body
                .get("model")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_owned(),
            task,
            prompt,
            conversation,
        }
    }

    /// Value of a `<label>: <value>` line in the prompt.
    #[allow(dead_code)]
    pub fn line_value(&self, label: &str) -> Option<&str> {
        let prefix = format!("{label}: ");
        self.prompt
            .lines()
            .find_map(|line| line.strip_prefix(prefix.as_str()))
            .map(str::trim)
    }
}

type Responder = dyn Fn(&StubRequest) -> Result<String, String> + Send + 'static;

/// Minimal OpenAI Responses API server on an ephemeral port.
///
/// `Err` answers become HTTP 500 with an OpenAI-style error body.
pub struct OpenAiStub {
    pub base_url: String,
    requests: Arc<Mutex<Vec<StubRequest>>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl OpenAiStub {
    pub fn spawn<F>(respond: F) -> Self
    where
        F: Fn(&StubRequest) -> Result<String, String> + Send + 'static,
    {
        let respond: Box<Responder> = Box::new(respond);
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start openai stub server");
        let addr = server.server_addr();
        let base_url = format!("http://{addr}/v1");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }

                let mut request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };

                if request.method() != &tiny_http::Method::Post || request.url() != "/v1/responses"
                {
                    let _ = request.respond(
                        tiny_http::Response::from_string("not found").with_status_code(404),
                    );
                    continue;
                }

                let mut body = String::new();
                if request.as_reader().read_to_string(&mut body).is_err() {
                    let _ = request.respond(
                        tiny_http::Response::from_string("invalid request body")
                            .with_status_code(400),
                    );
                    continue;
                }
                let parsed: Value = match serde_json::from_str(&body) {
                    Ok(value) => value,
                    Err(_) => {
                        let _ = request.respond(
                            tiny_http::Response::from_string("invalid json").with_status_code(400),
                        );
                        continue;
                    }
                };

                let stub_request = StubRequest::from_body(&parsed);
                let answer = respond(&stub_request);
                seen.lock().expect("lock requests").push(stub_request);

                let (status, response_body) = match answer {
                    Ok(output_text) => (
                        200,
                        serde_json::json!({
                            "id": "resp_stub",
                            "object": "response",
                            "model": parsed.get("model").cloned().unwrap_or(Value::Null),
                            "output": [
                                {
                                    "type": "message",
                                    "role": "assistant",
                                    "content": [
                                        { "type": "output_text", "text": output_text }
                                    ]
                                }
                            ],
                            "usage": { "input_tokens": 1000, "output_tokens": 100 }
                        }),
                    ),
                    Err(message) => (
                        500,
                        serde_json::json!({ "error": { "message": message } }),
                    ),
                };

                let header =
                    tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
                        .expect("build header");
                let response = tiny_http::Response::from_string(response_body.to_string())
                    .with_status_code(status)
                    .with_header(header);
                let _ = request.respond(response);
            }
        });

        Self {
            base_url,
            requests,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    #[allow(dead_code)]
    pub fn requests(&self) -> Vec<StubRequest> {
        self.requests.lock().expect("lock requests").clone()
    }

    #[allow(dead_code)]
    pub fn count(&self, task_prefix: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.task.starts_with(task_prefix))
            .count()
    }
}

impl Drop for OpenAiStub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
