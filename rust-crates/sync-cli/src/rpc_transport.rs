use base64::{
    Engine as _,
    engine::general_purpose::STANDARD,
};
use color_eyre::eyre::{
    self,
    WrapErr,
};
use futures::{
    SinkExt,
    StreamExt,
    future,
};
use ledger_sync::{
    AccountEvent,
    AccountId,
    Error,
    EventStream,
    LedgerTransport,
    ProgramId,
    ReliabilityProfile,
    Result,
    TransportEvent,
};
use serde::{
    Deserialize,
    de::DeserializeOwned,
};
use serde_json::{
    Value,
    json,
};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        Mutex,
        PoisonError,
        atomic::{
            AtomicU64,
            Ordering,
        },
    },
    time::Duration,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::Message,
};
use url::Url;

const COMMITMENT: &str = "confirmed";

/// Low bits of an event sequence carry the notification slot. The bits above
/// carry the subscription epoch.
const SLOT_BITS: u32 = 40;
const SLOT_MASK: u64 = (1 << SLOT_BITS) - 1;

/// Per-account subscription counters shared by every ledger of one client.
///
/// Slots only order notifications within one ledger. An event's sequence is
/// therefore the epoch of the subscription it arrived on followed by its
/// slot, and updates from a later subscription supersede earlier ones on
/// whichever ledger they were produced.
#[derive(Clone, Default)]
pub struct SubscriptionEpochs(Arc<Mutex<HashMap<AccountId, u64>>>);

impl SubscriptionEpochs {
    fn advance(&self, account: &AccountId) -> u64 {
        let mut epochs = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        let epoch = epochs.entry(*account).or_insert(0);
        *epoch += 1;
        *epoch
    }
}

fn event_sequence(epoch: u64, slot: u64) -> u64 {
    (epoch << SLOT_BITS) | slot.min(SLOT_MASK)
}

#[derive(Deserialize)]
struct RpcResponse<R> {
    result: Option<R>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct SlotContext {
    slot: u64,
}

#[derive(Deserialize)]
struct WithContext<V> {
    context: SlotContext,
    value: V,
}

#[derive(Deserialize)]
struct AccountInfo {
    owner: String,
}

#[derive(Deserialize)]
struct NotificationParams {
    result: WithContext<NotificationValue>,
}

/// `data` is `[encoded, encoding]`.
#[derive(Deserialize)]
struct NotificationValue {
    data: (String, String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Incoming {
    Notification {
        method: String,
        params: NotificationParams,
    },
    Reply {
        result: Option<Value>,
        error: Option<RpcErrorBody>,
    },
}

fn request_body(id: u64, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

fn parse_response<R: DeserializeOwned>(method: &str, bytes: &[u8]) -> Result<R> {
    let response: RpcResponse<R> = serde_json::from_slice(bytes)
        .map_err(|err| Error::Transport(format!("invalid {method} response: {err}")))?;
    match (response.result, response.error) {
        (_, Some(err)) => Err(Error::Transport(format!(
            "{method} failed with code {}: {}",
            err.code, err.message
        ))),
        (Some(result), None) => Ok(result),
        (None, None) => Err(Error::Transport(format!(
            "{method} returned neither result nor error"
        ))),
    }
}

#[derive(Clone)]
struct RpcHttp {
    url: Url,
    http: reqwest::Client,
    next_id: Arc<AtomicU64>,
}

impl RpcHttp {
    async fn call<R: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<R> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut request = self
            .http
            .post(self.url.clone())
            .json(&request_body(id, method, params));
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let res = request
            .send()
            .await
            .map_err(|err| Error::Transport(format!("{method} request failed: {err}")))?;
        let status = res.status();
        let bytes = res.bytes().await.map_err(|err| {
            Error::Transport(format!("failed to read {method} response body: {err}"))
        })?;
        if !status.is_success() {
            let body = String::from_utf8_lossy(&bytes);
            return Err(Error::Transport(format!(
                "{method} responded with {status}: {body}"
            )));
        }
        parse_response(method, &bytes)
    }
}

fn account_params(account: &AccountId) -> Value {
    json!([account.to_string(), { "encoding": "base64", "commitment": COMMITMENT }])
}

fn owner_of(info: WithContext<Option<AccountInfo>>) -> Result<Option<ProgramId>> {
    info.value.map(|info| info.owner.parse()).transpose()
}

/// A ledger reached over JSON-RPC for queries and submissions and over a
/// WebSocket for account subscriptions. Account ids travel base58 encoded.
pub struct RpcLedger {
    rpc: RpcHttp,
    ws_url: Url,
    epochs: SubscriptionEpochs,
}

impl RpcLedger {
    /// Ledgers of one client must share `epochs`.
    pub fn new(http_url: Url, ws_url: Url, epochs: SubscriptionEpochs) -> eyre::Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .wrap_err("failed to build HTTP client for ledger rpc")?;
        Ok(Self {
            rpc: RpcHttp {
                url: http_url,
                http,
                next_id: Arc::new(AtomicU64::new(1)),
            },
            ws_url,
            epochs,
        })
    }
}

impl LedgerTransport for RpcLedger {
    type Provider = RpcProvider;

    async fn get_account_owner(&self, account: &AccountId) -> Result<Option<ProgramId>> {
        let info = self
            .rpc
            .call("getAccountInfo", account_params(account), None)
            .await?;
        owner_of(info)
    }

    async fn subscribe_account(&self, account: &AccountId) -> Result<EventStream> {
        let (mut socket, _) = connect_async(self.ws_url.as_str()).await.map_err(|err| {
            Error::SubscriptionTransport(format!("connecting to {} failed: {err}", self.ws_url))
        })?;
        let request = request_body(1, "accountSubscribe", account_params(account));
        socket
            .send(Message::Text(request.to_string()))
            .await
            .map_err(|err| {
                Error::SubscriptionTransport(format!("sending accountSubscribe failed: {err}"))
            })?;

        let account = *account;
        let epoch = self.epochs.advance(&account);
        tracing::debug!(account = %account, epoch, "account subscription opened");
        let events = socket.filter_map(move |message| {
            future::ready(match message {
                Ok(message) => decode_message(&account, epoch, message),
                Err(err) => Some(TransportEvent::Disconnected(err.to_string())),
            })
        });
        Ok(events.boxed())
    }

    fn provider_for(&self, profile: &ReliabilityProfile) -> RpcProvider {
        RpcProvider {
            rpc: self.rpc.clone(),
            profile: *profile,
        }
    }
}

/// Submits transactions to one ledger with a fixed reliability profile.
#[derive(Clone)]
pub struct RpcProvider {
    rpc: RpcHttp,
    profile: ReliabilityProfile,
}

impl RpcProvider {
    pub fn profile(&self) -> &ReliabilityProfile {
        &self.profile
    }

    /// Returns the transaction signature reported by the ledger.
    pub async fn send_transaction(&self, transaction: &[u8]) -> Result<String> {
        self.rpc
            .call(
                "sendTransaction",
                send_transaction_params(transaction, &self.profile),
                Some(self.profile.confirmation_timeout),
            )
            .await
    }
}

fn send_transaction_params(transaction: &[u8], profile: &ReliabilityProfile) -> Value {
    json!([
        STANDARD.encode(transaction),
        {
            "encoding": "base64",
            "skipPreflight": profile.skip_preflight,
            "preflightCommitment": COMMITMENT,
        }
    ])
}

fn decode_message(account: &AccountId, epoch: u64, message: Message) -> Option<TransportEvent> {
    match message {
        Message::Text(text) => decode_text(account, epoch, &text),
        Message::Binary(bytes) => decode_text(account, epoch, &String::from_utf8_lossy(&bytes)),
        Message::Ping(_) | Message::Pong(_) => Some(TransportEvent::Heartbeat),
        Message::Close(frame) => Some(TransportEvent::Disconnected(
            frame
                .map(|frame| frame.reason.to_string())
                .filter(|reason| !reason.is_empty())
                .unwrap_or_else(|| "closed by server".to_string()),
        )),
        Message::Frame(_) => None,
    }
}

fn decode_text(account: &AccountId, epoch: u64, text: &str) -> Option<TransportEvent> {
    let incoming: Incoming = match serde_json::from_str(text) {
        Ok(incoming) => incoming,
        Err(err) => {
            tracing::warn!(account = %account, ?err, "unreadable subscription message");
            return None;
        }
    };
    match incoming {
        Incoming::Notification { method, params } if method == "accountNotification" => {
            let (data, _encoding) = params.result.value.data;
            match STANDARD.decode(data) {
                Ok(payload) => Some(TransportEvent::Update(AccountEvent::new(
                    *account,
                    event_sequence(epoch, params.result.context.slot),
                    payload,
                ))),
                Err(err) => {
                    tracing::warn!(account = %account, ?err, "undecodable account data");
                    None
                }
            }
        }
        Incoming::Notification { method, .. } => {
            tracing::debug!(account = %account, %method, "ignoring notification");
            None
        }
        Incoming::Reply {
            error: Some(err), ..
        } => Some(TransportEvent::Disconnected(format!(
            "subscription rejected with code {}: {}",
            err.code, err.message
        ))),
        Incoming::Reply {
            result: Some(_), ..
        } => Some(TransportEvent::Acknowledged),
        Incoming::Reply { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use ledger_sync::{
        ApplyOutcome,
        DelegationClassifier,
        LedgerKind,
        OwnerProgramClassifier,
        StateMirror,
    };

    const DELEGATION_PROGRAM: &str = "DELeGGvXpWV2fqJUhqcF5ZSYMS4JTLjteaAMARRSaeSh";

    fn account() -> AccountId {
        AccountId::from_label("game-42")
    }

    fn notification(slot: u64, data: &[u8]) -> String {
        json!({
            "jsonrpc": "2.0",
            "method": "accountNotification",
            "params": {
                "result": {
                    "context": { "slot": slot },
                    "value": {
                        "data": [STANDARD.encode(data), "base64"],
                        "owner": DELEGATION_PROGRAM,
                        "lamports": 33594,
                    }
                },
                "subscription": 23784
            }
        })
        .to_string()
    }

    #[test]
    fn decode_text__subscription_reply_acknowledges() {
        let event = decode_text(&account(), 1, r#"{"jsonrpc":"2.0","result":23784,"id":1}"#);
        assert_eq!(event, Some(TransportEvent::Acknowledged));
    }

    #[test]
    fn decode_text__notification_becomes_update_ordered_by_epoch_then_slot() {
        // given
        let text = notification(5199307, b"board state");

        // when
        let event = decode_text(&account(), 3, &text);

        // then
        let Some(TransportEvent::Update(update)) = event else {
            panic!("expected update, got {event:?}");
        };
        assert_eq!(update.account_id, account());
        assert_eq!(update.sequence >> SLOT_BITS, 3);
        assert_eq!(update.sequence & SLOT_MASK, 5199307);
        assert_eq!(update.payload, b"board state".to_vec());
    }

    #[test]
    fn decode_text__rollup_updates_supersede_base_after_migration() {
        // given
        let epochs = SubscriptionEpochs::default();
        let mirror = StateMirror::new();
        let base_epoch = epochs.advance(&account());
        let Some(TransportEvent::Update(on_base)) =
            decode_text(&account(), base_epoch, &notification(350_000_000, b"base"))
        else {
            panic!("expected base update");
        };
        mirror.apply(on_base);

        // when
        let rollup_epoch = epochs.advance(&account());
        let Some(TransportEvent::Update(on_rollup)) =
            decode_text(&account(), rollup_epoch, &notification(120_000, b"rollup"))
        else {
            panic!("expected rollup update");
        };
        let outcome = mirror.apply(on_rollup);

        // then
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(mirror.read(&account()).unwrap().payload, b"rollup".to_vec());
    }

    #[test]
    fn subscription_epochs__count_per_account() {
        let epochs = SubscriptionEpochs::default();
        let other = AccountId::from_label("game-43");

        assert_eq!(epochs.advance(&account()), 1);
        assert_eq!(epochs.clone().advance(&account()), 2);
        assert_eq!(epochs.advance(&other), 1);
    }

    #[test]
    fn decode_text__rejected_subscription_disconnects() {
        let event = decode_text(
            &account(),
            1,
            r#"{"jsonrpc":"2.0","error":{"code":-32602,"message":"Invalid param"},"id":1}"#,
        );
        assert!(matches!(event, Some(TransportEvent::Disconnected(reason)) if reason.contains("Invalid param")));
    }

    #[test]
    fn decode_text__garbage_is_skipped() {
        assert_eq!(decode_text(&account(), 1, "not json"), None);
    }

    #[test]
    fn decode_message__close_frame_disconnects() {
        let event = decode_message(&account(), 1, Message::Close(None));
        assert_eq!(
            event,
            Some(TransportEvent::Disconnected("closed by server".into()))
        );
    }

    #[test]
    fn parse_response__surfaces_rpc_error() {
        let result: Result<u64> = parse_response(
            "getAccountInfo",
            br#"{"jsonrpc":"2.0","error":{"code":-32005,"message":"node is behind"},"id":3}"#,
        );
        assert_eq!(
            result,
            Err(Error::Transport(
                "getAccountInfo failed with code -32005: node is behind".into()
            ))
        );
    }

    #[test]
    fn parse_response__missing_account_has_no_owner() {
        // given
        let body = br#"{"jsonrpc":"2.0","result":{"context":{"slot":1},"value":null},"id":1}"#;

        // when
        let info: WithContext<Option<AccountInfo>> =
            parse_response("getAccountInfo", body).unwrap();

        // then
        assert!(info.value.is_none());
    }

    #[test]
    fn owner_of__reads_base58_owner_from_account_info() {
        // given
        let body = format!(
            r#"{{"jsonrpc":"2.0","result":{{"context":{{"apiVersion":"2.0.15","slot":341197053}},"value":{{"data":["","base64"],"executable":false,"lamports":1461600,"owner":"{DELEGATION_PROGRAM}","rentEpoch":18446744073709551615,"space":80}}}},"id":1}}"#
        );

        // when
        let info = parse_response("getAccountInfo", body.as_bytes()).unwrap();
        let owner = owner_of(info).unwrap();

        // then
        let program: ProgramId = DELEGATION_PROGRAM.parse().unwrap();
        assert_eq!(owner, Some(program));
        assert_eq!(
            OwnerProgramClassifier::new(program).classify(owner.as_ref()),
            LedgerKind::Ephemeral
        );
    }

    #[test]
    fn account_params__send_base58_id() {
        let params = account_params(&account());

        let sent: AccountId = params[0].as_str().unwrap().parse().unwrap();
        assert_eq!(sent, account());
        assert_eq!(params[0], json!(bs58::encode(account().as_bytes()).into_string()));
    }

    #[test]
    fn send_transaction_params__carries_profile_preflight_choice() {
        let fast = send_transaction_params(b"tx", &ReliabilityProfile::fast_write());
        let durable = send_transaction_params(b"tx", &ReliabilityProfile::durable_write());

        assert_eq!(fast[0], json!(STANDARD.encode(b"tx")));
        assert_eq!(fast[1]["skipPreflight"], json!(true));
        assert_eq!(durable[1]["skipPreflight"], json!(false));
    }
}
