//! Handler side: the child-process end of the supervision contract.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};
use xmltree::Element;

use pmobus::{verbs, Envelope, ReplySink, RequestPump};
use pmoutils::conversions::time_interval_in_seconds;
use pmoutils::xml::parse_str;

use crate::HandlerError;

/// Initial backoff before retrying a failed pull. Doubles on every
/// failure, capped at the refresh rate; reset on success.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_REFRESH_RATE: &str = "1 HOUR";

const NEAR_IMMEDIATE: Duration = Duration::from_millis(100);

/// Command line contract shared by every handler binary:
/// `<handler-binary> <req-url> <one-off-token> [--uuid <id>]`.
#[derive(Debug, Clone)]
pub struct HandlerOptions {
    pub req_addr: String,
    pub registration_token: String,
    pub uuid: Option<String>,
}

impl HandlerOptions {
    pub fn from_args<I: Iterator<Item = String>>(mut args: I) -> Result<HandlerOptions, HandlerError> {
        let req_addr = args
            .next()
            .ok_or_else(|| HandlerError::BadArguments("missing request address".into()))?;
        let registration_token = args
            .next()
            .ok_or_else(|| HandlerError::BadArguments("missing registration token".into()))?;
        let mut uuid = None;
        while let Some(flag) = args.next() {
            match flag.as_str() {
                "--uuid" => {
                    uuid = Some(args.next().ok_or_else(|| {
                        HandlerError::BadArguments("--uuid needs a value".into())
                    })?);
                }
                other => {
                    return Err(HandlerError::BadArguments(format!(
                        "unexpected argument '{other}'"
                    )));
                }
            }
        }
        Ok(HandlerOptions {
            req_addr,
            registration_token,
            uuid,
        })
    }
}

struct HandlerState {
    registered: AtomicBool,
    params: Mutex<HashMap<String, String>>,
    token: Mutex<Option<String>>,
}

#[async_trait]
impl ReplySink for HandlerState {
    async fn on_reply(&self, reply: Envelope) {
        match reply.verb() {
            "params" => match verbs::params_map(reply.body()) {
                Ok(params) => {
                    let Some(token) = params.get("token").cloned() else {
                        warn!("params did not contain compulsory parameter: token");
                        return;
                    };
                    debug!("params received from manager");
                    *self.token.lock().unwrap() = Some(token);
                    *self.params.lock().unwrap() = params;
                    self.registered.store(true, Ordering::SeqCst);
                }
                Err(e) => warn!("bad params reply: {e}"),
            },
            "pong" => {}
            "error" => warn!("manager replied with an error"),
            other => debug!("ignoring reply verb '{other}'"),
        }
    }

    fn idle_ping(&self) -> Option<Envelope> {
        if !self.registered.load(Ordering::SeqCst) {
            return None;
        }
        let token = self.token.lock().unwrap().clone();
        Some(Envelope::request(verbs::ping(), token.as_deref()))
    }
}

/// Connection of a handler process back to its manager.
///
/// Owns the request pump; messages are queued and the pump emits a
/// ping whenever the queue has been quiet for a check-in interval,
/// which is the sole liveness signal the manager sees.
pub struct HandlerContext {
    options: HandlerOptions,
    state: Arc<HandlerState>,
    pump: RequestPump,
}

impl HandlerContext {
    pub fn connect(options: HandlerOptions) -> HandlerContext {
        let state = Arc::new(HandlerState {
            registered: AtomicBool::new(false),
            params: Mutex::new(HashMap::new()),
            token: Mutex::new(None),
        });
        let pump = RequestPump::spawn(options.req_addr.clone(), Arc::clone(&state) as _);
        HandlerContext {
            options,
            state,
            pump,
        }
    }

    /// Send the one-off registration message.
    pub fn register(&self) {
        let register = verbs::register(&self.options.registration_token);
        self.pump.enqueue(Envelope::request(register, None));
    }

    /// Wait for the `params` reply that completes registration.
    /// Not completing within the window is fatal for a handler; the
    /// manager sees the death and restarts us.
    pub async fn wait_registered(
        &self,
        timeout: Duration,
    ) -> Result<HashMap<String, String>, HandlerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.state.registered.load(Ordering::SeqCst) {
            if tokio::time::Instant::now() >= deadline {
                return Err(HandlerError::Registration(
                    "no params received within the registration window".into(),
                ));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(self.params())
    }

    pub fn params(&self) -> HashMap<String, String> {
        self.state.params.lock().unwrap().clone()
    }

    pub fn uuid(&self) -> Option<&str> {
        self.options.uuid.as_deref()
    }

    /// Queue a request wrapped with the current token.
    pub fn send(&self, body: Element) {
        let token = self.state.token.lock().unwrap().clone();
        self.pump.enqueue(Envelope::request(body, token.as_deref()));
    }

    pub async fn stop(self) {
        self.pump.stop().await;
    }
}

/// A source a pull handler re-reads on schedule.
#[async_trait]
pub trait PullSource: Send {
    /// Fetch the current document text.
    async fn read(&mut self) -> Result<String, HandlerError>;
}

/// Drives a [`PullSource`]: a near-immediate first read, then one read
/// every refresh interval. Failed reads are retried after a backoff
/// window that doubles up to the refresh rate and resets on success.
pub struct PullDriver {
    uri: String,
    refresh_rate: Duration,
    window: Duration,
}

impl PullDriver {
    /// Build from the handler's params: `uri` is compulsory, `refresh`
    /// is a time-interval string defaulting to one hour.
    pub fn from_params(params: &HashMap<String, String>) -> Result<PullDriver, HandlerError> {
        let uri = params
            .get("uri")
            .cloned()
            .ok_or_else(|| HandlerError::Registration("params did not include a uri".into()))?;
        let refresh = params
            .get("refresh")
            .map(String::as_str)
            .unwrap_or(DEFAULT_REFRESH_RATE);
        let refresh_rate = time_interval_in_seconds(refresh)
            .map_err(|e| HandlerError::Registration(format!("could not parse refresh rate: {e}")))?;
        Ok(PullDriver {
            uri,
            refresh_rate: Duration::from_secs(refresh_rate),
            window: DEFAULT_WINDOW,
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Run forever: read, forward, sleep, repeat. The process lives
    /// until the manager kills it.
    pub async fn run(mut self, ctx: &HandlerContext, mut source: impl PullSource) {
        tokio::time::sleep(NEAR_IMMEDIATE).await;
        loop {
            let delay = match source.read().await {
                Ok(text) => match parse_str(&text) {
                    Ok(body) => {
                        ctx.send(verbs::subscription_update(&self.uri, body));
                        self.success()
                    }
                    Err(e) => self.fail(&format!("fetched document is not XML: {e}")),
                },
                Err(e) => self.fail(&e.to_string()),
            };
            tokio::time::sleep(delay).await;
        }
    }

    /// Next delay after a successful read.
    pub fn success(&mut self) -> Duration {
        self.window = DEFAULT_WINDOW;
        self.refresh_rate
    }

    /// Next delay after a failed read: double the window, never beyond
    /// the refresh rate.
    pub fn fail(&mut self, cause: &str) -> Duration {
        warn!("{cause}");
        self.window = (self.window * 2).min(self.refresh_rate);
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver(refresh: &str) -> PullDriver {
        let mut params = HashMap::new();
        params.insert("uri".to_string(), "file:///tmp/root.xml".to_string());
        params.insert("refresh".to_string(), refresh.to_string());
        PullDriver::from_params(&params).unwrap()
    }

    #[test]
    fn options_parse_positional_and_uuid() {
        let args = ["127.0.0.1:55346", "one-off", "--uuid", "r-1"]
            .into_iter()
            .map(String::from);
        let options = HandlerOptions::from_args(args).unwrap();
        assert_eq!(options.req_addr, "127.0.0.1:55346");
        assert_eq!(options.registration_token, "one-off");
        assert_eq!(options.uuid.as_deref(), Some("r-1"));
    }

    #[test]
    fn options_require_addr_and_token() {
        let args = ["127.0.0.1:55346"].into_iter().map(String::from);
        assert!(HandlerOptions::from_args(args).is_err());
    }

    #[test]
    fn backoff_doubles_up_to_the_refresh_rate() {
        let mut driver = driver("1 HOUR");
        assert_eq!(driver.fail("x"), Duration::from_secs(120));
        assert_eq!(driver.fail("x"), Duration::from_secs(240));
        for _ in 0..10 {
            driver.fail("x");
        }
        assert_eq!(driver.fail("x"), Duration::from_secs(3600));
    }

    #[test]
    fn backoff_never_exceeds_a_short_refresh_rate() {
        let mut driver = driver("90 SECS");
        assert_eq!(driver.fail("x"), Duration::from_secs(90));
        assert_eq!(driver.fail("x"), Duration::from_secs(90));
    }

    #[test]
    fn success_resets_the_window() {
        let mut driver = driver("1 HOUR");
        driver.fail("x");
        driver.fail("x");
        assert_eq!(driver.success(), Duration::from_secs(3600));
        assert_eq!(driver.fail("x"), Duration::from_secs(120));
    }

    #[test]
    fn refresh_rate_defaults_to_an_hour() {
        let mut params = HashMap::new();
        params.insert("uri".to_string(), "file:///r.xml".to_string());
        let driver = PullDriver::from_params(&params).unwrap();
        assert_eq!(driver.refresh_rate, Duration::from_secs(3600));
    }
}
