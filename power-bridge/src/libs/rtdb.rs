//! Realtime database client over the REST protocol.
//!
//! - Nodes are addressed as `{database_url}/{path}.json`.
//! - Subscriptions use the `text/event-stream` protocol: `put` events on the subscribed node become
//!   [`CommandNotification::Value`] and silence longer than the stream timeout becomes
//!   [`CommandNotification::Timeout`] followed by a reconnect.
//! - With an API key, an anonymous user is signed up and its ID token is refreshed before it
//!   expires.

use std::{
    error::Error as StdError,
    io::{Error as IoError, ErrorKind},
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use reqwest::{Client, Response, header};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::{
    sync::{
        Notify,
        mpsc::{self, Receiver, Sender},
    },
    task::{self, JoinHandle},
    time,
};
use url::Url;

use super::{
    sse::SseParser,
    store::{CommandNotification, RemoteStore, StoreError, command_string},
};

pub struct Options {
    /// Database root such as `https://<db>.firebasedatabase.app/`.
    pub database_url: String,
    /// Web API key used to sign up an anonymous user.
    pub api_key: Option<String>,
    /// Static credential (ID token or database secret). Takes precedence over `api_key`.
    pub auth_token: Option<String>,
    /// Longest silence of a subscription before it is reported and reconnected.
    pub stream_timeout: Duration,
}

#[derive(Clone)]
pub struct RtdbClient {
    inner: Arc<Inner>,
}

struct Inner {
    base: Url,
    client: Client,
    stream_client: Client,
    api_key: Option<String>,
    token: RwLock<Option<String>>,
    refresh: Notify,
    stream_timeout: Duration,
    auth_task: Mutex<Option<JoinHandle<()>>>,
}

/// An ID token with its refresh token.
struct Credential {
    id_token: String,
    refresh_token: String,
    expires_in: Duration,
}

#[derive(Deserialize)]
struct SignUpRes {
    #[serde(rename = "idToken")]
    id_token: String,
    #[serde(rename = "refreshToken")]
    refresh_token: String,
    #[serde(rename = "expiresIn")]
    expires_in: String,
}

#[derive(Deserialize)]
struct RefreshRes {
    id_token: String,
    refresh_token: String,
    expires_in: String,
}

#[derive(Deserialize)]
struct PutEvent {
    path: String,
    data: Value,
}

#[derive(Deserialize)]
struct ErrorRes {
    error: Value,
}

const SIGN_UP_URL: &'static str = "https://identitytoolkit.googleapis.com/v1/accounts:signUp";
const REFRESH_URL: &'static str = "https://securetoken.googleapis.com/v1/token";
const REQUEST_TIMEOUT_MS: u64 = 10000;
const READ_TIMEOUT: &'static str = "1s";
const WRITE_SIZE_LIMIT: &'static str = "tiny";
const AUTH_RETRY_MS: u64 = 2000;
const REFRESH_MARGIN_SECS: u64 = 300;
const RECONNECT_MS: u64 = 1000;
const SUBSCRIBE_QUEUE: usize = 16;

impl RtdbClient {
    pub fn new(opts: Options) -> Result<Self, Box<dyn StdError>> {
        let mut base = match Url::parse(opts.database_url.as_str()) {
            Err(e) => return Err(Box::new(IoError::new(ErrorKind::InvalidInput, e))),
            Ok(url) => url,
        };
        if !base.path().ends_with('/') {
            base.set_path(format!("{}/", base.path()).as_str());
        }
        let client = Client::builder()
            .timeout(Duration::from_millis(REQUEST_TIMEOUT_MS))
            .build()?;
        let stream_client = Client::builder()
            .connect_timeout(Duration::from_millis(REQUEST_TIMEOUT_MS))
            .build()?;

        let static_token = opts.auth_token.is_some();
        let rtdb = RtdbClient {
            inner: Arc::new(Inner {
                base,
                client,
                stream_client,
                api_key: opts.api_key,
                token: RwLock::new(opts.auth_token),
                refresh: Notify::new(),
                stream_timeout: opts.stream_timeout,
                auth_task: Mutex::new(None),
            }),
        };
        if let Some(api_key) = rtdb.inner.api_key.as_ref() {
            if !static_token {
                let handle = create_auth_loop(rtdb.clone(), api_key.clone());
                *rtdb.inner.auth_task.lock().unwrap() = Some(handle);
            }
        }
        Ok(rtdb)
    }

    fn token(&self) -> Option<String> {
        self.inner.token.read().unwrap().clone()
    }

    /// URL of the node at `path` with the credential and the given extra query parameters.
    fn node_url(&self, path: &str, params: &[(&str, &str)]) -> Result<Url, StoreError> {
        let node = format!("{}.json", path.trim_matches('/'));
        let mut url = match self.inner.base.join(node.as_str()) {
            Err(e) => {
                return Err(StoreError::Request {
                    path: path.to_string(),
                    reason: e.to_string(),
                });
            }
            Ok(url) => url,
        };
        let token = self.token();
        if token.is_some() || params.len() > 0 {
            let mut query = url.query_pairs_mut();
            if let Some(token) = token.as_ref() {
                query.append_pair("auth", token.as_str());
            }
            for (key, value) in params.iter() {
                query.append_pair(key, value);
            }
        }
        Ok(url)
    }

    async fn sign_up(&self, api_key: &str) -> Result<Credential, StoreError> {
        let resp = self
            .inner
            .client
            .post(SIGN_UP_URL)
            .query(&[("key", api_key)])
            .json(&serde_json::json!({ "returnSecureToken": true }))
            .send()
            .await
            .map_err(|e| request_error("signUp", e))?;
        let res: SignUpRes = check_response("signUp", resp)
            .await?
            .json()
            .await
            .map_err(|e| response_error("signUp", e))?;
        Ok(Credential {
            id_token: res.id_token,
            refresh_token: res.refresh_token,
            expires_in: parse_expires_in(res.expires_in.as_str()),
        })
    }

    async fn refresh(&self, api_key: &str, refresh_token: &str) -> Result<Credential, StoreError> {
        let resp = self
            .inner
            .client
            .post(REFRESH_URL)
            .query(&[("key", api_key)])
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await
            .map_err(|e| request_error("token", e))?;
        let res: RefreshRes = check_response("token", resp)
            .await?
            .json()
            .await
            .map_err(|e| response_error("token", e))?;
        Ok(Credential {
            id_token: res.id_token,
            refresh_token: res.refresh_token,
            expires_in: parse_expires_in(res.expires_in.as_str()),
        })
    }

    async fn open_stream(&self, path: &str) -> Result<Response, StoreError> {
        let url = self.node_url(path, &[])?;
        let resp = self
            .inner
            .stream_client
            .get(url)
            .header(header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| request_error(path, e))?;
        check_response(path, resp).await
    }

    /// Forward events of one stream connection. Returns `false` when the receiver is gone.
    async fn read_stream(
        &self,
        path: &str,
        resp: Response,
        tx: &Sender<CommandNotification>,
    ) -> bool {
        const FN_NAME: &'static str = "RtdbClient::read_stream";

        let mut stream = resp.bytes_stream();
        let mut parser = SseParser::new();
        loop {
            let chunk = match time::timeout(self.inner.stream_timeout, stream.next()).await {
                Err(_) => {
                    warn!("[{}] stream {} timeout", FN_NAME, path);
                    return tx.send(CommandNotification::Timeout).await.is_ok();
                }
                Ok(None) => {
                    info!("[{}] stream {} closed", FN_NAME, path);
                    return true;
                }
                Ok(Some(Err(e))) => {
                    error!("[{}] stream {} error: {}", FN_NAME, path, e);
                    return true;
                }
                Ok(Some(Ok(chunk))) => chunk,
            };
            for event in parser.push(&chunk) {
                match event.event.as_str() {
                    "put" => match parse_put(event.data.as_str()) {
                        Err(e) => warn!("[{}] invalid put data {}: {}", FN_NAME, event.data, e),
                        Ok(None) => debug!("[{}] skip child put: {}", FN_NAME, event.data),
                        Ok(Some(value)) => {
                            if tx.send(CommandNotification::Value(value)).await.is_err() {
                                return false;
                            }
                        }
                    },
                    "keep-alive" => (),
                    "cancel" => {
                        warn!("[{}] stream {} cancelled: {}", FN_NAME, path, event.data);
                        return true;
                    }
                    "auth_revoked" => {
                        warn!("[{}] stream {} auth revoked", FN_NAME, path);
                        self.inner.refresh.notify_one();
                        return true;
                    }
                    _ => debug!("[{}] skip event {}: {}", FN_NAME, event.event, event.data),
                }
            }
        }
    }
}

#[async_trait]
impl RemoteStore for RtdbClient {
    fn is_ready(&self) -> bool {
        self.inner.api_key.is_none() || self.inner.token.read().unwrap().is_some()
    }

    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        if !self.is_ready() {
            return Err(StoreError::NotReady);
        }
        let url = self.node_url(path, &[("timeout", READ_TIMEOUT)])?;
        let resp = self
            .inner
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| request_error(path, e))?;
        let value: Value = check_response(path, resp)
            .await?
            .json()
            .await
            .map_err(|e| response_error(path, e))?;
        match value {
            Value::Null => Ok(None),
            value => Ok(Some(value)),
        }
    }

    async fn update(&self, path: &str, fields: &Map<String, Value>) -> Result<(), StoreError> {
        if !self.is_ready() {
            return Err(StoreError::NotReady);
        }
        let url = self.node_url(path, &[("writeSizeLimit", WRITE_SIZE_LIMIT)])?;
        let resp = self
            .inner
            .client
            .patch(url)
            .json(fields)
            .send()
            .await
            .map_err(|e| request_error(path, e))?;
        check_response(path, resp).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        if !self.is_ready() {
            return Err(StoreError::NotReady);
        }
        let url = self.node_url(path, &[("writeSizeLimit", WRITE_SIZE_LIMIT)])?;
        let resp = self
            .inner
            .client
            .delete(url)
            .send()
            .await
            .map_err(|e| request_error(path, e))?;
        check_response(path, resp).await?;
        Ok(())
    }

    async fn subscribe(&self, path: &str) -> Result<Receiver<CommandNotification>, StoreError> {
        if !self.is_ready() {
            return Err(StoreError::NotReady);
        }
        // Validate the path once before handing it to the stream task.
        self.node_url(path, &[])?;

        let (tx, rx) = mpsc::channel(SUBSCRIBE_QUEUE);
        create_stream_loop(self.clone(), path.to_string(), tx);
        Ok(rx)
    }
}

/// To create the task that keeps the ID token fresh.
fn create_auth_loop(rtdb: RtdbClient, api_key: String) -> JoinHandle<()> {
    task::spawn(async move {
        const FN_NAME: &'static str = "auth_loop";

        let mut refresh_token: Option<String> = None;
        loop {
            let result = match refresh_token.as_ref() {
                None => rtdb.sign_up(api_key.as_str()).await,
                Some(token) => rtdb.refresh(api_key.as_str(), token.as_str()).await,
            };
            let wait = match result {
                Err(e) => {
                    error!("[{}] authenticate error: {}", FN_NAME, e);
                    Duration::from_millis(AUTH_RETRY_MS)
                }
                Ok(cred) => {
                    {
                        *rtdb.inner.token.write().unwrap() = Some(cred.id_token);
                    }
                    refresh_token = Some(cred.refresh_token);
                    info!(
                        "[{}] token ready, expires in {}s",
                        FN_NAME,
                        cred.expires_in.as_secs()
                    );
                    refresh_after(cred.expires_in)
                }
            };
            tokio::select! {
                _ = time::sleep(wait) => {}
                _ = rtdb.inner.refresh.notified() => {
                    info!("[{}] refresh requested", FN_NAME);
                }
            }
        }
    })
}

/// To create the task that keeps one subscription open until the receiver is dropped.
fn create_stream_loop(
    rtdb: RtdbClient,
    path: String,
    tx: Sender<CommandNotification>,
) -> JoinHandle<()> {
    task::spawn(async move {
        const FN_NAME: &'static str = "stream_loop";

        loop {
            if tx.is_closed() {
                debug!("[{}] receiver of {} dropped, stop", FN_NAME, path);
                return;
            }
            if rtdb.is_ready() {
                match rtdb.open_stream(path.as_str()).await {
                    Err(e) => error!("[{}] begin stream {} error: {}", FN_NAME, path, e),
                    Ok(resp) => {
                        info!("[{}] stream {} started", FN_NAME, path);
                        if !rtdb.read_stream(path.as_str(), resp, &tx).await {
                            return;
                        }
                    }
                }
            }
            time::sleep(Duration::from_millis(RECONNECT_MS)).await;
        }
    })
}

/// Extract the new value of the subscribed node from `put` event data.
///
/// Returns `None` for puts below the node.
fn parse_put(data: &str) -> Result<Option<String>, serde_json::Error> {
    let put: PutEvent = serde_json::from_str(data)?;
    match put.path.as_str() {
        "/" => Ok(Some(command_string(&put.data))),
        _ => Ok(None),
    }
}

fn parse_expires_in(value: &str) -> Duration {
    Duration::from_secs(value.trim().parse::<u64>().unwrap_or(0))
}

/// Wait time before refreshing a token that expires in `expires_in`.
fn refresh_after(expires_in: Duration) -> Duration {
    let wait = expires_in.saturating_sub(Duration::from_secs(REFRESH_MARGIN_SECS));
    wait.max(Duration::from_millis(AUTH_RETRY_MS))
}

async fn check_response(path: &str, resp: Response) -> Result<Response, StoreError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    Err(StoreError::Status {
        path: path.to_string(),
        status,
        reason: error_reason(body.as_str()),
    })
}

/// The `error` field of an error body, or the body itself.
fn error_reason(body: &str) -> String {
    match serde_json::from_str::<ErrorRes>(body) {
        Ok(ErrorRes {
            error: Value::String(reason),
        }) => reason,
        Ok(ErrorRes { error }) => match error.get("message").and_then(|m| m.as_str()) {
            None => error.to_string(),
            Some(message) => message.to_string(),
        },
        Err(_) => body.to_string(),
    }
}

fn request_error(path: &str, e: reqwest::Error) -> StoreError {
    StoreError::Request {
        path: path.to_string(),
        reason: e.to_string(),
    }
}

fn response_error(path: &str, e: reqwest::Error) -> StoreError {
    StoreError::Response {
        path: path.to_string(),
        reason: e.to_string(),
    }
}
