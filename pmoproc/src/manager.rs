//! Manager side: spawning, watching and restarting handler
//! subprocesses.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use pmobus::{verbs, Envelope, ReplyEndpoint, RequestHandler};

use crate::{
    ManagerError, SUBPROCESS_CHECKIN_TIMEOUT, SUBPROCESS_CHECK_INTERVAL, SUBPROCESS_FAILED_LIMIT,
    SUBPROCESS_KILLTERM_TIMEOUT, SUBPROCESS_REGISTRATION_TIMEOUT, SUBPROCESS_RESTART_DELAY,
    SUBPROCESS_RESTART_SLEEP,
};

/// Everything needed to start (and restart) one kind of handler.
#[derive(Debug, Clone, Default)]
pub struct HandlerStub {
    /// Binary plus leading arguments. The request address and the
    /// one-off token are appended at spawn time.
    pub command_line_args: Vec<String>,
    /// Arguments appended after the address and token (e.g.
    /// `--uuid <id>` for renderers).
    pub trailing_args: Vec<String>,
    /// Parameters delivered to the handler in the `params` reply.
    pub params: HashMap<String, String>,
}

impl HandlerStub {
    pub fn new<I, S>(command_line_args: I) -> HandlerStub
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        HandlerStub {
            command_line_args: command_line_args.into_iter().map(Into::into).collect(),
            trailing_args: Vec::new(),
            params: HashMap::new(),
        }
    }

    pub fn with_param(mut self, name: &str, value: &str) -> HandlerStub {
        self.params.insert(name.to_string(), value.to_string());
        self
    }
}

/// Verb handling a concrete manager layers on top of the base.
///
/// `register` and `ping` never reach the delegate; everything else
/// does, after the token guard has run. Returning `None` makes the
/// endpoint reply with an error element.
#[async_trait]
pub trait ManagerDelegate: Send + Sync + 'static {
    async fn handle_verb(&self, manager: &Manager, request: &Envelope) -> Option<Envelope>;
}

/// One supervised subprocess with captured stderr and a rotating
/// security token. Used by [`Manager`] for its handlers and directly
/// by the display manager for renderers.
pub struct Subprocess {
    id: String,
    stub: HandlerStub,
    security_token: String,
    child: Option<Child>,
    stderr_task: Option<JoinHandle<()>>,
    /// Set by the stderr reader when it hits EOF, i.e. the child is
    /// gone or going.
    stderr_done: Arc<AtomicBool>,
    started_at: Option<Instant>,
    registered_at: Option<Instant>,
    last_checkin: Option<Instant>,
    stop_requested: bool,
}

impl Subprocess {
    pub fn new(stub: HandlerStub) -> Subprocess {
        Subprocess {
            id: format!("{:x}", Uuid::new_v4().as_u128()),
            stub,
            security_token: Uuid::new_v4().to_string(),
            child: None,
            stderr_task: None,
            stderr_done: Arc::new(AtomicBool::new(false)),
            started_at: None,
            registered_at: None,
            last_checkin: None,
            stop_requested: false,
        }
    }

    pub fn start(&mut self, connect_addr: &str) -> Result<(), ManagerError> {
        // Each handler is started with the address to connect back to
        // the manager on, and an initial security token to be sent in
        // the registration message.
        let mut args = self.stub.command_line_args.clone();
        args.push(connect_addr.to_string());
        args.push(self.security_token.clone());
        args.extend(self.stub.trailing_args.iter().cloned());
        debug!("(spid={}) starting subprocess: args are {args:?}", self.id);

        let mut command = Command::new(&args[0]);
        command.args(&args[1..]).stderr(Stdio::piped());
        let mut child = command.spawn()?;

        self.started_at = Some(Instant::now());
        if let Some(stderr) = child.stderr.take() {
            let id = self.id.clone();
            let done = Arc::clone(&self.stderr_done);
            self.stderr_task = Some(tokio::spawn(async move {
                forward_stderr(id, stderr).await;
                done.store(true, Ordering::SeqCst);
            }));
        }
        self.child = Some(child);
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stub(&self) -> &HandlerStub {
        &self.stub
    }

    pub fn security_token(&self) -> &str {
        &self.security_token
    }

    pub fn is_registered(&self) -> bool {
        self.registered_at.is_some()
    }

    /// Refresh the liveness clock after any authenticated message.
    pub fn touch_checkin(&mut self) {
        self.last_checkin = Some(Instant::now());
    }

    /// Rotate the security token and mark the registration time.
    pub fn register(&mut self) {
        self.registered_at = Some(Instant::now());
        self.security_token = Uuid::new_v4().to_string();
        debug!("(spid={}) subprocess registration", self.id);
    }

    pub fn has_token(&self, token: &str) -> bool {
        self.security_token == token
    }

    pub fn erroneous_state_requires_stop(&self) -> bool {
        // Either we've not been asked to start yet,
        let Some(started_at) = self.started_at else {
            debug!("(spid={}) status check: not started yet", self.id);
            return false;
        };
        // or we've been asked to stop,
        if self.stop_requested {
            return false;
        }
        // or we expect normal execution.
        if self.stderr_done.load(Ordering::SeqCst) {
            debug!("(spid={}) status check: stopped unexpectedly (handler error)", self.id);
            return true;
        }
        match self.registered_at {
            None => {
                let expired = started_at.elapsed() > SUBPROCESS_REGISTRATION_TIMEOUT;
                if expired {
                    error!("(spid={}) registration expiry check: registration expired", self.id);
                }
                expired
            }
            Some(registered_at) => {
                let due = self.last_checkin.unwrap_or(registered_at) + SUBPROCESS_CHECKIN_TIMEOUT;
                let overdue = Instant::now() > due;
                if overdue {
                    debug!("(spid={}) status check: checkin overdue", self.id);
                }
                overdue
            }
        }
    }

    /// Stop the subprocess: graceful terminate, wait, hard kill, wait
    /// again, complain if it is still around.
    pub async fn stop(&mut self) {
        if self.stop_requested {
            return;
        }
        self.stop_requested = true;

        if let Some(child) = self.child.as_mut() {
            if still_running(child) {
                terminate(child);
                if !wait_with_timeout(child, SUBPROCESS_KILLTERM_TIMEOUT).await {
                    warn!("(spid={}) subprocess did not terminate, sending kill", self.id);
                    let _ = child.start_kill();
                    if !wait_with_timeout(child, SUBPROCESS_KILLTERM_TIMEOUT).await {
                        warn!("(spid={}) subprocess did not respond to kill", self.id);
                    }
                }
            }
        }

        if let Some(task) = self.stderr_task.take() {
            let _ = task.await;
        }
    }
}

fn still_running(child: &mut Child) -> bool {
    matches!(child.try_wait(), Ok(None))
}

#[cfg(unix)]
fn terminate(child: &Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn terminate(child: &Child) {
    // No graceful signal available, the kill escalation below applies.
    let _ = child;
}

async fn wait_with_timeout(child: &mut Child, timeout: std::time::Duration) -> bool {
    tokio::time::timeout(timeout, child.wait()).await.is_ok()
}

/// Read the child's stderr line by line into our log. Lines may carry a
/// `LEVEL: ` prefix; anything unlabelled is logged as a warning.
async fn forward_stderr(id: String, stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once(": ") {
            Some(("DEBUG", msg)) => debug!("(spid={id}) {msg}"),
            Some(("INFO", msg)) => info!("(spid={id}) {msg}"),
            Some(("WARNING", msg)) => warn!("(spid={id}) {msg}"),
            Some(("ERROR", msg)) => error!("(spid={id}) {msg}"),
            _ => warn!("(spid={id}) {line}"),
        }
    }
    debug!("(spid={id}) detected process termination, reader will stop");
}

struct ManagerInner {
    description: String,
    /// Address the reply endpoint binds, and that handlers connect to.
    rep_addr: String,
    executing: Mutex<HashMap<String, Subprocess>>,
    stubs: std::sync::Mutex<HashMap<String, HandlerStub>>,
    failed_count: AtomicU32,
    delegate: Mutex<Option<Arc<dyn ManagerDelegate>>>,
    endpoint: Mutex<Option<ReplyEndpoint>>,
    checker: Mutex<Option<JoinHandle<()>>>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    reset_lock: Mutex<()>,
}

/// Base for the manager applications. Cheap to clone; all state is
/// shared.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

struct ManagerRpc(Manager);

#[async_trait]
impl RequestHandler for ManagerRpc {
    async fn handle(&self, request: Envelope) -> Option<Envelope> {
        self.0.handle_request(request).await
    }
}

impl Manager {
    pub fn new(rep_addr: impl Into<String>, description: impl Into<String>) -> Manager {
        Manager {
            inner: Arc::new(ManagerInner {
                description: description.into(),
                rep_addr: rep_addr.into(),
                executing: Mutex::new(HashMap::new()),
                stubs: std::sync::Mutex::new(HashMap::new()),
                failed_count: AtomicU32::new(0),
                delegate: Mutex::new(None),
                endpoint: Mutex::new(None),
                checker: Mutex::new(None),
                stop_tx: Mutex::new(None),
                reset_lock: Mutex::new(()),
            }),
        }
    }

    pub fn description(&self) -> &str {
        &self.inner.description
    }

    /// The address handlers are told to connect back to.
    pub fn rep_addr(&self) -> &str {
        &self.inner.rep_addr
    }

    /// Install the delegate that handles this manager's specific verbs.
    pub async fn set_delegate(&self, delegate: Arc<dyn ManagerDelegate>) {
        *self.inner.delegate.lock().await = Some(delegate);
    }

    /// Drop the delegate (and whatever it holds on to) at shutdown.
    pub async fn clear_delegate(&self) {
        *self.inner.delegate.lock().await = None;
    }

    /// Register a handler stub under a key (usually a URI scheme).
    pub fn add_handler(&self, key: &str, stub: HandlerStub) {
        self.inner
            .stubs
            .lock()
            .unwrap()
            .insert(key.to_string(), stub);
    }

    pub fn get_handler_stub(&self, key: &str) -> Option<HandlerStub> {
        self.inner.stubs.lock().unwrap().get(key).cloned()
    }

    /// Stub for the scheme of the given URI, with the `uri` param set.
    pub fn uri_handler_stub(&self, uri: &str) -> Result<HandlerStub, ManagerError> {
        let parsed = url::Url::parse(uri).map_err(|_| ManagerError::BadUri(uri.to_string()))?;
        let scheme = parsed.scheme().to_string();
        let mut stub = self
            .get_handler_stub(&scheme)
            .ok_or(ManagerError::UnknownScheme(scheme))?;
        stub.params.insert("uri".to_string(), uri.to_string());
        Ok(stub)
    }

    /// Whether a running handler instance already serves this URI.
    pub async fn lookup_running_handler_for_uri(&self, uri: &str) -> Option<String> {
        let executing = self.inner.executing.lock().await;
        executing
            .values()
            .find(|record| record.stub.params.get("uri").map(String::as_str) == Some(uri))
            .map(|record| record.id.clone())
    }

    /// Main entry point: bind the endpoint and start the status
    /// checker.
    pub fn start(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), ManagerError>> + Send + '_>>
    {
        Box::pin(async move {
            let (stop_tx, stop_rx) = watch::channel(false);
            *self.inner.stop_tx.lock().await = Some(stop_tx);

            let rpc: Arc<dyn RequestHandler> = Arc::new(ManagerRpc(self.clone()));
            let endpoint = ReplyEndpoint::bind(&self.inner.rep_addr, rpc).await?;
            *self.inner.endpoint.lock().await = Some(endpoint);

            let checker = tokio::spawn(check_handlers(self.clone(), stop_rx));
            *self.inner.checker.lock().await = Some(checker);
            info!("{} listening on {}", self.inner.description, self.inner.rep_addr);
            Ok(())
        })
    }

    /// Start a new handler subprocess from a stub. Returns the
    /// subprocess id.
    pub async fn start_handler(&self, stub: HandlerStub) -> Result<String, ManagerError> {
        if self.inner.stop_tx.lock().await.is_none() {
            return Err(ManagerError::NotExecuting);
        }
        let mut record = Subprocess::new(stub);
        record.start(&self.inner.rep_addr)?;
        let id = record.id.clone();
        self.inner.executing.lock().await.insert(id.clone(), record);
        Ok(id)
    }

    /// Stop one handler and drop its record.
    pub async fn stop_handler(&self, handler_id: &str) {
        let record = self.inner.executing.lock().await.remove(handler_id);
        if let Some(mut record) = record {
            debug!("terminating handler with id {handler_id}");
            record.stop().await;
        }
    }

    /// Terminate the manager and every handler it supervises.
    pub async fn stop(&self) {
        if let Some(endpoint) = self.inner.endpoint.lock().await.take() {
            endpoint.stop().await;
        }
        if let Some(stop_tx) = self.inner.stop_tx.lock().await.take() {
            let _ = stop_tx.send(true);
        }
        let ids: Vec<String> = self.inner.executing.lock().await.keys().cloned().collect();
        for id in ids {
            self.stop_handler(&id).await;
        }
        if let Some(checker) = self.inner.checker.lock().await.take() {
            let _ = checker.await;
        }
    }

    /// Tear everything down, let the world settle, then start afresh.
    /// Runs when handler restarts exceed the failure limit.
    async fn reinitialize(&self) {
        warn!("{}: too many handler failures, reinitializing", self.inner.description);
        let _guard = self.inner.reset_lock.lock().await;
        self.stop().await;
        tokio::time::sleep(SUBPROCESS_RESTART_SLEEP).await;
        self.inner.failed_count.store(0, Ordering::SeqCst);
        if let Err(e) = self.start().await {
            error!("{}: reinitialization failed: {e}", self.inner.description);
        }
    }

    async fn handle_request(&self, request: Envelope) -> Option<Envelope> {
        match request.verb() {
            "register" => self.handle_register(&request).await,
            "ping" => {
                self.touch_checkin(&request, "ping").await;
                Some(Envelope::reply(verbs::pong(), request.token.as_deref()))
            }
            _ => {
                self.touch_checkin(&request, request.verb()).await;
                let delegate = self.inner.delegate.lock().await.clone();
                match delegate {
                    Some(delegate) => delegate.handle_verb(self, &request).await,
                    None => None,
                }
            }
        }
    }

    // The one-off registration token never authenticates anything but
    // this message; a fresh token is issued in the reply and required
    // from then on.
    async fn handle_register(&self, request: &Envelope) -> Option<Envelope> {
        let token = request.token.as_deref()?;
        let mut executing = self.inner.executing.lock().await;
        let record = executing.values_mut().find(|r| r.has_token(token));
        let Some(record) = record else {
            warn!("spoof handler registration attempt: token is {token}");
            return None;
        };
        record.register();

        let mut params = record.stub.params.clone();
        params.insert("token".to_string(), record.security_token.clone());
        let reply = Envelope::reply(verbs::params(&params), None);

        // A successful registration buys back one failure.
        let _ = self
            .inner
            .failed_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                Some(count.saturating_sub(1))
            });
        Some(reply)
    }

    /// Token guard for every verb other than `register`: look the
    /// sender up by token, refresh its check-in clock, warn when the
    /// token is unknown.
    async fn touch_checkin(&self, request: &Envelope, call: &str) {
        let Some(token) = request.token.as_deref() else {
            return;
        };
        let mut executing = self.inner.executing.lock().await;
        match executing.values_mut().find(|r| r.has_token(token)) {
            Some(record) => record.last_checkin = Some(Instant::now()),
            None => warn!("{call} received for unknown handler: token is {token}"),
        }
    }
}

async fn check_handlers(manager: Manager, mut stop_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(SUBPROCESS_CHECK_INTERVAL) => {}
            _ = stop_rx.changed() => return,
        }

        let failing: Vec<(String, HandlerStub)> = {
            let executing = manager.inner.executing.lock().await;
            executing
                .values()
                .filter(|record| record.erroneous_state_requires_stop())
                .map(|record| (record.id.clone(), record.stub.clone()))
                .collect()
        };

        for (id, stub) in failing {
            let count = manager.inner.failed_count.fetch_add(1, Ordering::SeqCst) + 1;
            debug!("trying to restart handler {id} - attempt number {count}");
            manager.stop_handler(&id).await;

            if count > SUBPROCESS_FAILED_LIMIT {
                debug!("handler restart has failed {count} times, reinitializing now");
                let manager = manager.clone();
                tokio::spawn(async move { manager.reinitialize().await });
                return;
            }

            // A short break before the replacement start ensures that
            // repeated failures won't spin the CPU.
            let manager = manager.clone();
            tokio::spawn(async move {
                tokio::time::sleep(SUBPROCESS_RESTART_DELAY).await;
                if let Err(e) = manager.start_handler(stub).await {
                    warn!("could not start replacement handler: {e}");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_builder() {
        let stub = HandlerStub::new(["/usr/bin/handler"]).with_param("uri", "file:///r.xml");
        assert_eq!(stub.command_line_args, vec!["/usr/bin/handler"]);
        assert_eq!(stub.params.get("uri").unwrap(), "file:///r.xml");
    }

    #[test]
    fn fresh_record_is_not_erroneous() {
        let record = Subprocess::new(HandlerStub::default());
        assert!(!record.erroneous_state_requires_stop());
    }

    #[test]
    fn unregistered_record_fails_after_registration_timeout() {
        let mut record = Subprocess::new(HandlerStub::default());
        record.started_at = Some(Instant::now() - SUBPROCESS_REGISTRATION_TIMEOUT * 2);
        assert!(record.erroneous_state_requires_stop());

        record.stop_requested = true;
        assert!(!record.erroneous_state_requires_stop());
    }

    #[test]
    fn registered_record_fails_when_checkins_stop() {
        let mut record = Subprocess::new(HandlerStub::default());
        let long_ago = Instant::now() - SUBPROCESS_CHECKIN_TIMEOUT * 3;
        record.started_at = Some(long_ago);
        record.registered_at = Some(long_ago);
        assert!(record.erroneous_state_requires_stop());

        record.last_checkin = Some(Instant::now());
        assert!(!record.erroneous_state_requires_stop());
    }

    #[test]
    fn dead_reader_means_failure() {
        let mut record = Subprocess::new(HandlerStub::default());
        record.started_at = Some(Instant::now());
        record.registered_at = Some(Instant::now());
        record.last_checkin = Some(Instant::now());
        record.stderr_done.store(true, Ordering::SeqCst);
        assert!(record.erroneous_state_requires_stop());
    }

    #[test]
    fn token_rotates_on_registration() {
        let mut record = Subprocess::new(HandlerStub::default());
        let one_off = record.security_token.clone();
        record.register();
        assert!(!record.has_token(&one_off));
        assert!(record.registered_at.is_some());
    }
}
