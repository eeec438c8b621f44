//! JavaScript runtime for extension scripts
//!
//! One Deno Core isolate per evaluated script. The isolate gets a small
//! prelude (console, fetch, URLSearchParams, error classes) and two host
//! ops; every network request a script makes is routed through
//! [`HostBindings::fetch`], which applies the sandbox policy and the
//! source's rate-limit guard.
//!
//! A [`JsRuntime`] is not `Send`; see [`crate::extension::worker`] for the
//! thread that owns it.

use crate::core::error::{Result, TsukiyoError};
use crate::core::http::{HttpRequest, HttpTransport};
use crate::core::rate_limit::RateLimitGuard;
use crate::extension::contract::CapabilityReport;
use crate::extension::sandbox::{ResourceLimits, ScriptSandbox};
use deno_core::error::AnyError;
use deno_core::{op2, v8, Extension, JsRuntime, Op, OpState, RuntimeOptions};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const PRELUDE: &str = include_str!("prelude.js");
const HOST_GLOBAL: &str = "__tsukiyo_host";

/// Host services available to one script, stored in the isolate's op state
#[derive(Clone)]
pub struct HostBindings {
    pub source_id: String,
    pub transport: Arc<dyn HttpTransport>,
    pub guard: Arc<RateLimitGuard>,
    pub sandbox: ScriptSandbox,
    pub fetch_timeout: Duration,
}

/// Request options a script passes to `fetch`
#[derive(Debug, Default, Deserialize)]
pub struct FetchInit {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

/// What the `fetch` shim receives back
///
/// `blocked` is set when no usable response exists; the shim turns it
/// into the matching script-side exception.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchReply {
    pub status: u16,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl FetchReply {
    fn blocked(kind: &'static str, url: String, err: &TsukiyoError) -> Self {
        Self {
            url,
            blocked: Some(kind),
            message: Some(err.to_string()),
            ..Default::default()
        }
    }
}

impl HostBindings {
    /// Perform a request on behalf of the script
    pub async fn fetch(&self, url: String, init: FetchInit) -> FetchReply {
        if let Err(e) = self.sandbox.check_network_access(&url) {
            warn!(source = %self.source_id, url = %url, "Script request denied: {}", e);
            return FetchReply::blocked("denied", url, &e);
        }

        if let Err(e) = self.guard.check() {
            debug!(source = %self.source_id, url = %url, "Script request refused while cooling down");
            return FetchReply::blocked("rate_limited", url, &e);
        }

        let mut request = HttpRequest::new(init.method.unwrap_or_else(|| "GET".to_string()), url.clone());
        request.headers = init.headers.into_iter().collect();
        request.body = init.body;

        let sent = tokio::time::timeout(self.fetch_timeout, self.sandbox.send(self.transport.as_ref(), request)).await;
        let response = match sent {
            Err(_) => {
                let err = TsukiyoError::Timeout(format!("request to {} exceeded {:?}", url, self.fetch_timeout));
                return FetchReply::blocked("timeout", url, &err);
            }
            Ok(Err(e @ TsukiyoError::Timeout(_))) => return FetchReply::blocked("timeout", url, &e),
            Ok(Err(e @ TsukiyoError::PermissionDenied(_))) => {
                warn!(source = %self.source_id, url = %url, "Script request denied: {}", e);
                return FetchReply::blocked("denied", url, &e);
            }
            Ok(Err(e)) => return FetchReply::blocked("network", url, &e),
            Ok(Ok(response)) => response,
        };

        if self.guard.record_status(response.status) {
            return FetchReply::blocked("rate_limited", url, &self.guard.rate_limited_error());
        }

        FetchReply {
            status: response.status,
            url: response.url.clone(),
            body: response.text(),
            headers: response.headers,
            blocked: None,
            message: None,
        }
    }
}

#[op2(async)]
#[serde]
async fn op_tsukiyo_fetch(
    state: Rc<RefCell<OpState>>,
    #[string] url: String,
    #[serde] init: Option<FetchInit>,
) -> std::result::Result<FetchReply, AnyError> {
    let bindings = state.borrow().borrow::<HostBindings>().clone();
    Ok(bindings.fetch(url, init.unwrap_or_default()).await)
}

#[derive(Debug, Deserialize)]
struct ScriptLog {
    level: String,
    message: String,
}

#[op2]
fn op_tsukiyo_log(state: &mut OpState, #[serde] entry: ScriptLog) {
    let source = state.borrow::<HostBindings>().source_id.as_str();
    match entry.level.as_str() {
        "debug" => debug!(source = %source, "[script] {}", entry.message),
        "warn" => warn!(source = %source, "[script] {}", entry.message),
        "error" => error!(source = %source, "[script] {}", entry.message),
        _ => info!(source = %source, "[script] {}", entry.message),
    }
}

/// How a contract call ended, as reported by the prelude
#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum InvocationOutcome {
    Success {
        #[serde(default)]
        value: Value,
    },
    RateLimited {
        #[serde(default)]
        message: Option<String>,
    },
    Network {
        #[serde(default)]
        message: Option<String>,
    },
    Timeout {
        #[serde(default)]
        message: Option<String>,
    },
    Denied {
        #[serde(default)]
        message: Option<String>,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    Pending,
}

/// Terminates the isolate if a deadline passes before it is disarmed
struct Watchdog {
    cancel: Option<mpsc::Sender<()>>,
    fired: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    fn arm(handle: v8::IsolateHandle, limit: Duration) -> Self {
        let (cancel, rx) = mpsc::channel::<()>();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();

        let thread = std::thread::Builder::new()
            .name("ext-watchdog".to_string())
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(limit) {
                    flag.store(true, Ordering::SeqCst);
                    handle.terminate_execution();
                }
            })
            .map_err(|e| warn!("Failed to start script watchdog: {}", e))
            .ok();

        Self {
            cancel: Some(cancel),
            fired,
            thread,
        }
    }

    /// Stop the watchdog; returns true if it terminated the isolate
    fn disarm(mut self) -> bool {
        drop(self.cancel.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.fired.load(Ordering::SeqCst)
    }
}

/// A Deno Core isolate hosting one extension script
pub struct ScriptRuntime {
    runtime: JsRuntime,
    label: String,
    guard: Arc<RateLimitGuard>,
    limits: ResourceLimits,
    sequence: u64,
}

impl ScriptRuntime {
    /// Create an isolate with the host prelude installed
    pub fn new(label: impl Into<String>, bindings: HostBindings, limits: ResourceLimits) -> Result<Self> {
        let label = label.into();
        let guard = bindings.guard.clone();

        let ext = Extension {
            name: "tsukiyo_host",
            ops: std::borrow::Cow::Borrowed(&[op_tsukiyo_fetch::DECL, op_tsukiyo_log::DECL]),
            ..Default::default()
        };

        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![ext],
            ..Default::default()
        });
        runtime.op_state().borrow_mut().put(bindings);

        runtime
            .execute_script("<tsukiyo_prelude>", PRELUDE.to_string().into())
            .map_err(|e| TsukiyoError::ExtensionEvaluationFailed(format!("Failed to install host prelude: {}", e)))?;

        debug!(label = %label, "Script runtime created");

        Ok(Self {
            runtime,
            label,
            guard,
            limits,
            sequence: 0,
        })
    }

    /// Evaluate extension code and describe the object it produced
    pub fn load(&mut self, code: &str) -> Result<CapabilityReport> {
        let started = Instant::now();
        let watchdog = Watchdog::arm(self.runtime.v8_isolate().thread_safe_handle(), self.limits.max_evaluation_time);
        let result = self.call_host("load", &[code]);
        if watchdog.disarm() {
            self.runtime.v8_isolate().cancel_terminate_execution();
            return Err(TsukiyoError::ExtensionEvaluationFailed(format!(
                "evaluation of {} exceeded {:?}",
                self.label, self.limits.max_evaluation_time
            )));
        }

        let described = result
            .map_err(TsukiyoError::ExtensionEvaluationFailed)?
            .ok_or_else(|| TsukiyoError::ExtensionEvaluationFailed("host prelude returned nothing".to_string()))?;

        debug!(label = %self.label, elapsed_ms = started.elapsed().as_millis() as u64, "Script evaluated");
        Ok(serde_json::from_str(&described)?)
    }

    /// Call a contract member with positional arguments and wait for it to settle
    pub async fn invoke(&mut self, member: &str, args: Vec<Value>) -> Result<Value> {
        self.sequence += 1;
        let id = self.sequence.to_string();
        let args_json = serde_json::to_string(&args)?;

        let watchdog = Watchdog::arm(self.runtime.v8_isolate().thread_safe_handle(), self.limits.max_call_time);
        let outcome = self.drive(&id, member, &args_json).await;
        if watchdog.disarm() {
            self.runtime.v8_isolate().cancel_terminate_execution();
            return Err(TsukiyoError::Timeout(format!(
                "{}.{} exceeded {:?}",
                self.label, member, self.limits.max_call_time
            )));
        }

        match outcome? {
            InvocationOutcome::Success { value } => Ok(value),
            InvocationOutcome::RateLimited { message } => {
                debug!(label = %self.label, member, "Script reported rate limit: {:?}", message);
                Err(self.guard.rate_limited_error())
            }
            InvocationOutcome::Network { message } => Err(TsukiyoError::NetworkError(
                message.unwrap_or_else(|| "network request failed".to_string()),
            )),
            InvocationOutcome::Timeout { message } => Err(TsukiyoError::Timeout(
                message.unwrap_or_else(|| format!("{}.{} timed out", self.label, member)),
            )),
            InvocationOutcome::Denied { message } => Err(TsukiyoError::PermissionDenied(
                message.unwrap_or_else(|| "request denied".to_string()),
            )),
            InvocationOutcome::Error { message } => Err(TsukiyoError::ExtensionCallFailed(format!(
                "{}.{}: {}",
                self.label,
                member,
                message.unwrap_or_else(|| "unknown error".to_string())
            ))),
            InvocationOutcome::Pending => Err(TsukiyoError::ExtensionCallFailed(format!(
                "{}.{} never settled",
                self.label, member
            ))),
        }
    }

    async fn drive(&mut self, id: &str, member: &str, args_json: &str) -> Result<InvocationOutcome> {
        self.call_host("invoke", &[id, member, args_json])
            .map_err(|e| TsukiyoError::ExtensionCallFailed(format!("{}.{}: {}", self.label, member, e)))?;

        match tokio::time::timeout(self.limits.max_call_time, self.runtime.run_event_loop(Default::default())).await {
            Err(_) => {
                return Err(TsukiyoError::Timeout(format!(
                    "{}.{} exceeded {:?}",
                    self.label, member, self.limits.max_call_time
                )))
            }
            Ok(Err(e)) => {
                return Err(TsukiyoError::ExtensionCallFailed(format!("{}.{}: {}", self.label, member, e)));
            }
            Ok(Ok(())) => {}
        }

        let taken = self
            .call_host("take", &[id])
            .map_err(TsukiyoError::ExtensionCallFailed)?
            .unwrap_or_else(|| r#"{"status":"pending"}"#.to_string());

        Ok(serde_json::from_str(&taken)?)
    }

    /// Call a method of the prelude's host object with string arguments
    ///
    /// Returns the stringified result, or the exception message.
    fn call_host(&mut self, method: &str, args: &[&str]) -> std::result::Result<Option<String>, String> {
        let scope = &mut self.runtime.handle_scope();
        let context = scope.get_current_context();
        let global = context.global(scope);

        let host_key = v8::String::new(scope, HOST_GLOBAL).ok_or("failed to allocate string")?;
        let host_val = global
            .get(scope, host_key.into())
            .ok_or_else(|| format!("{} not found", HOST_GLOBAL))?;
        let host = v8::Local::<v8::Object>::try_from(host_val).map_err(|_| format!("{} is not an object", HOST_GLOBAL))?;

        let method_key = v8::String::new(scope, method).ok_or("failed to allocate string")?;
        let method_val = host
            .get(scope, method_key.into())
            .ok_or_else(|| format!("{} not found", method))?;
        let func = v8::Local::<v8::Function>::try_from(method_val).map_err(|_| format!("{} is not a function", method))?;

        let mut argv: Vec<v8::Local<v8::Value>> = Vec::with_capacity(args.len());
        for arg in args {
            let value = v8::String::new(scope, arg).ok_or("argument too large")?;
            argv.push(value.into());
        }

        let tc = &mut v8::TryCatch::new(scope);
        match func.call(tc, host.into(), &argv) {
            Some(value) if value.is_null_or_undefined() => Ok(None),
            Some(value) => Ok(value.to_string(tc).map(|s| s.to_rust_string_lossy(tc))),
            None => {
                if tc.has_terminated() {
                    return Err("execution terminated".to_string());
                }
                let message = tc
                    .exception()
                    .and_then(|e| e.to_string(tc))
                    .map(|s| s.to_rust_string_lossy(tc))
                    .unwrap_or_else(|| "unknown exception".to_string());
                Err(message)
            }
        }
    }

    /// Evaluate a bare expression in the isolate's global scope
    pub fn evaluate_expression(&mut self, code: &str) -> Result<String> {
        let global = self
            .runtime
            .execute_script("<tsukiyo_eval>", code.to_string().into())
            .map_err(|e| TsukiyoError::ExtensionCallFailed(e.to_string()))?;

        let scope = &mut self.runtime.handle_scope();
        let local = v8::Local::new(scope, global);
        Ok(local
            .to_string(scope)
            .map(|s| s.to_rust_string_lossy(scope))
            .unwrap_or_default())
    }

    /// Ask V8 to release memory
    pub fn garbage_collect(&mut self) {
        self.runtime.v8_isolate().low_memory_notification();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::http::StaticTransport;
    use crate::core::rate_limit::ManualClock;
    use serde_json::json;

    fn bindings(transport: Arc<StaticTransport>, guard: Arc<RateLimitGuard>) -> HostBindings {
        HostBindings {
            source_id: "test".to_string(),
            transport,
            guard,
            sandbox: ScriptSandbox::default(),
            fetch_timeout: Duration::from_secs(5),
        }
    }

    fn runtime_with(transport: Arc<StaticTransport>) -> (ScriptRuntime, Arc<RateLimitGuard>) {
        let guard = Arc::new(RateLimitGuard::with_clock(
            "test",
            Duration::from_secs(60),
            Arc::new(ManualClock::new(0)),
        ));
        let limits = ResourceLimits {
            max_evaluation_time: Duration::from_secs(2),
            max_call_time: Duration::from_secs(5),
        };
        let runtime = ScriptRuntime::new("test", bindings(transport, guard.clone()), limits).unwrap();
        (runtime, guard)
    }

    const ECHO: &str = r#"
        module.exports = {
            id: 'echo', name: 'Echo', version: '0.2.0',
            search: async (query, options) => [{ id: query, title: String(options.limit) }],
            explorer: async () => ({}),
            informations: async () => ({ details: null, chapters: [] }),
            chapters: async () => [],
            reader: async () => [],
            isRateLimited: () => false,
        };
    "#;

    #[tokio::test]
    async fn test_load_describes_module_exports() {
        let (mut runtime, _) = runtime_with(Arc::new(StaticTransport::new()));
        let report = runtime.load(ECHO).unwrap();

        assert!(report.present);
        assert_eq!(report.id.as_deref(), Some("echo"));
        assert_eq!(report.version.as_deref(), Some("0.2.0"));
        assert!(report.missing_members().is_empty());
    }

    #[tokio::test]
    async fn test_load_legacy_global_slot_and_alias() {
        let (mut runtime, _) = runtime_with(Arc::new(StaticTransport::new()));
        let report = runtime
            .load(
                r#"
                globalThis.extension = {
                    id: 'legacy', name: 'Legacy',
                    search() {}, explorer() {}, informations() {}, chapters() {}, reader() {},
                    isApiRateLimited() { return false; },
                };
                "#,
            )
            .unwrap();

        assert!(report.present);
        assert!(report.missing_members().is_empty());
        assert_eq!(runtime.evaluate_expression("typeof globalThis.extension").unwrap(), "undefined");
    }

    #[tokio::test]
    async fn test_load_factory_return_value() {
        let (mut runtime, _) = runtime_with(Arc::new(StaticTransport::new()));
        let report = runtime.load("return { id: 'ret', name: 'Returned', search() {} };").unwrap();
        assert_eq!(report.id.as_deref(), Some("ret"));
        assert_eq!(report.missing_members().len(), 5);
    }

    #[tokio::test]
    async fn test_load_nothing_and_syntax_error() {
        let (mut runtime, _) = runtime_with(Arc::new(StaticTransport::new()));
        assert!(!runtime.load("const x = 1;").unwrap().present);

        let err = runtime.load("this is not javascript").unwrap_err();
        assert!(matches!(err, TsukiyoError::ExtensionEvaluationFailed(_)));
    }

    #[tokio::test]
    async fn test_runaway_evaluation_is_terminated() {
        let (mut runtime, _) = runtime_with(Arc::new(StaticTransport::new()));
        let err = runtime.load("while (true) {}").unwrap_err();
        assert!(matches!(err, TsukiyoError::ExtensionEvaluationFailed(_)));

        // The isolate stays usable afterwards.
        assert!(runtime.load(ECHO).unwrap().present);
    }

    #[tokio::test]
    async fn test_invoke_passes_arguments() {
        let (mut runtime, _) = runtime_with(Arc::new(StaticTransport::new()));
        runtime.load(ECHO).unwrap();

        let value = runtime
            .invoke("search", vec![json!("one piece"), json!({ "limit": 3 })])
            .await
            .unwrap();
        assert_eq!(value, json!([{ "id": "one piece", "title": "3" }]));
    }

    #[tokio::test]
    async fn test_invoke_uses_host_fetch() {
        let transport = Arc::new(StaticTransport::new());
        transport.route_json("https://api.example.org/list", &json!({ "data": [1, 2, 3] }));
        let (mut runtime, _) = runtime_with(transport.clone());

        runtime
            .load(
                r#"
                module.exports = {
                    id: 'net', name: 'Net',
                    search: async () => {
                        const res = await fetch('https://api.example.org/list?' + new URLSearchParams({ q: 'a b' }));
                        const body = await res.json();
                        return body.data;
                    },
                };
                "#,
            )
            .unwrap();

        let value = runtime.invoke("search", vec![]).await.unwrap();
        assert_eq!(value, json!([1, 2, 3]));
        assert_eq!(transport.requests()[0].url, "https://api.example.org/list?q=a%20b");
    }

    #[tokio::test]
    async fn test_429_trips_guard_and_maps_to_rate_limited() {
        let transport = Arc::new(StaticTransport::new());
        transport.route("https://api.example.org/", 429, "slow down");
        let (mut runtime, guard) = runtime_with(transport.clone());

        runtime
            .load("module.exports = { id: 'x', name: 'X', search: async () => (await fetch('https://api.example.org/a')).json() };")
            .unwrap();

        let err = runtime.invoke("search", vec![]).await.unwrap_err();
        assert!(matches!(err, TsukiyoError::RateLimited { .. }));
        assert!(guard.is_rate_limited());

        // Further calls are refused without touching the transport.
        let err = runtime.invoke("search", vec![]).await.unwrap_err();
        assert!(matches!(err, TsukiyoError::RateLimited { .. }));
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn test_script_errors_and_denied_requests() {
        let (mut runtime, _) = runtime_with(Arc::new(StaticTransport::new()));
        runtime
            .load(
                r#"
                module.exports = {
                    id: 'x', name: 'X',
                    search: async () => { throw new Error('boom'); },
                    reader: async () => fetch('http://127.0.0.1:1/secret'),
                    chapters: async () => { throw new Error('RATE_LIMITED'); },
                };
                "#,
            )
            .unwrap();

        match runtime.invoke("search", vec![]).await.unwrap_err() {
            TsukiyoError::ExtensionCallFailed(message) => assert!(message.contains("boom")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(matches!(
            runtime.invoke("reader", vec![]).await.unwrap_err(),
            TsukiyoError::PermissionDenied(_)
        ));
        assert!(matches!(
            runtime.invoke("chapters", vec![]).await.unwrap_err(),
            TsukiyoError::RateLimited { .. }
        ));
        assert!(matches!(
            runtime.invoke("informations", vec![]).await.unwrap_err(),
            TsukiyoError::ExtensionCallFailed(_)
        ));
    }

    #[tokio::test]
    async fn test_redirect_into_private_network_is_denied() {
        let transport = Arc::new(StaticTransport::new());
        transport.route_with_headers(
            "https://api.example.org/jump",
            302,
            vec![("Location".to_string(), "http://169.254.169.254/latest/meta-data".to_string())],
            "",
        );
        let (mut runtime, _) = runtime_with(transport.clone());
        runtime
            .load("module.exports = { id: 'x', name: 'X', search: async () => (await fetch('https://api.example.org/jump')).text() };")
            .unwrap();

        assert!(matches!(
            runtime.invoke("search", vec![]).await.unwrap_err(),
            TsukiyoError::PermissionDenied(_)
        ));
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn test_never_settling_call() {
        let (mut runtime, _) = runtime_with(Arc::new(StaticTransport::new()));
        runtime
            .load("module.exports = { id: 'x', name: 'X', search: () => new Promise(() => {}) };")
            .unwrap();

        let err = runtime.invoke("search", vec![]).await.unwrap_err();
        assert!(matches!(err, TsukiyoError::ExtensionCallFailed(_)));
    }

    #[tokio::test]
    async fn test_host_internals_hidden_from_script() {
        let (mut runtime, _) = runtime_with(Arc::new(StaticTransport::new()));
        let report = runtime
            .load(
                r#"
                const global = Function('return this')();
                module.exports = {
                    id: [typeof Deno, typeof globalThis.Deno, typeof global.Deno, typeof global.__bootstrap].join('-'),
                    name: String(this === globalThis),
                };
                "#,
            )
            .unwrap();
        assert_eq!(report.id.as_deref(), Some("undefined-undefined-undefined-undefined"));
        assert_eq!(report.name.as_deref(), Some("false"));
        assert_eq!(runtime.evaluate_expression("typeof globalThis.Deno").unwrap(), "undefined");

        let frozen = runtime
            .evaluate_expression("(() => { try { __tsukiyo_host.load = null; } catch (_) {} return typeof __tsukiyo_host.load; })()")
            .unwrap();
        assert_eq!(frozen, "function");
    }

    #[tokio::test]
    async fn test_host_ops_still_work_after_namespace_removed() {
        let transport = Arc::new(StaticTransport::new());
        transport.route("https://api.example.org/", 200, "pong");
        let (mut runtime, _) = runtime_with(transport);
        runtime
            .load("module.exports = { id: 'x', name: 'X', search: async () => { console.log('ping'); return (await fetch('https://api.example.org/')).text(); } };")
            .unwrap();

        assert_eq!(runtime.invoke("search", vec![]).await.unwrap(), json!("pong"));
    }
}
