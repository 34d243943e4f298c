use crate::error::AppError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_ENDPOINT_URL: &str = "wss://trench-stream.jup.ag/ws";
pub const ENDPOINT_ENV_VAR: &str = "LAUNCHPAD_STREAM_URL";
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 2_500;
pub const DEFAULT_RESUBSCRIBE_GRACE_MS: u64 = 100;
pub const DEFAULT_LIVE_REFRESH_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_MARK_MIN_USD_VOLUME: f64 = 5.0;
pub const MIN_RECONNECT_DELAY_MS: u64 = 50;
pub const MAX_RECONNECT_DELAY_MS: u64 = 60_000;
pub const MAX_RESUBSCRIBE_GRACE_MS: u64 = 5_000;
pub const MIN_LIVE_REFRESH_INTERVAL_MS: u64 = 250;
pub const MAX_LIVE_REFRESH_INTERVAL_MS: u64 = 60_000;

pub const CATEGORY_LIST_CAPACITY: usize = 30;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Live,
    Reconnecting,
    Stopped,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatusSnapshot {
    pub state: ConnectionState,
    pub endpoint_url: String,
    pub reconnect_attempt: u32,
    pub messages_received: u64,
    pub decode_failures: u64,
    pub reconnects: u64,
    pub last_message_at_ms: Option<i64>,
    pub reason: Option<String>,
}

impl StreamStatusSnapshot {
    pub fn stopped(endpoint_url: String, reason: Option<String>) -> Self {
        Self {
            state: ConnectionState::Stopped,
            endpoint_url,
            reconnect_attempt: 0,
            messages_received: 0,
            decode_failures: 0,
            reconnects: 0,
            last_message_at_ms: None,
            reason,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartStreamArgs {
    pub endpoint_url: Option<String>,
    pub reconnect_delay_ms: Option<u64>,
    pub resubscribe_grace_ms: Option<u64>,
    pub live_refresh_interval_ms: Option<u64>,
    pub mark_min_usd_volume: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub endpoint_url: String,
    pub reconnect_delay_ms: u64,
    pub resubscribe_grace_ms: u64,
    pub live_refresh_interval_ms: u64,
    pub mark_min_usd_volume: f64,
}

fn resolve_endpoint_url(explicit: Option<String>) -> String {
    explicit
        .or_else(|| std::env::var(ENDPOINT_ENV_VAR).ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_ENDPOINT_URL.to_string())
}

impl StartStreamArgs {
    pub fn normalize(self) -> Result<StreamConfig, AppError> {
        let endpoint_url = resolve_endpoint_url(self.endpoint_url);
        if !(endpoint_url.starts_with("ws://") || endpoint_url.starts_with("wss://")) {
            return Err(AppError::InvalidArgument(
                "endpointUrl must use the ws:// or wss:// scheme".to_string(),
            ));
        }

        let reconnect_delay_ms = self
            .reconnect_delay_ms
            .unwrap_or(DEFAULT_RECONNECT_DELAY_MS);
        if !(MIN_RECONNECT_DELAY_MS..=MAX_RECONNECT_DELAY_MS).contains(&reconnect_delay_ms) {
            return Err(AppError::InvalidArgument(format!(
                "reconnectDelayMs must be between {MIN_RECONNECT_DELAY_MS} and {MAX_RECONNECT_DELAY_MS}"
            )));
        }

        let resubscribe_grace_ms = self
            .resubscribe_grace_ms
            .unwrap_or(DEFAULT_RESUBSCRIBE_GRACE_MS);
        if resubscribe_grace_ms > MAX_RESUBSCRIBE_GRACE_MS {
            return Err(AppError::InvalidArgument(format!(
                "resubscribeGraceMs must not exceed {MAX_RESUBSCRIBE_GRACE_MS}"
            )));
        }

        let live_refresh_interval_ms = self
            .live_refresh_interval_ms
            .unwrap_or(DEFAULT_LIVE_REFRESH_INTERVAL_MS);
        if !(MIN_LIVE_REFRESH_INTERVAL_MS..=MAX_LIVE_REFRESH_INTERVAL_MS)
            .contains(&live_refresh_interval_ms)
        {
            return Err(AppError::InvalidArgument(format!(
                "liveRefreshIntervalMs must be between {MIN_LIVE_REFRESH_INTERVAL_MS} and {MAX_LIVE_REFRESH_INTERVAL_MS}"
            )));
        }

        let mark_min_usd_volume = self
            .mark_min_usd_volume
            .unwrap_or(DEFAULT_MARK_MIN_USD_VOLUME);
        if !mark_min_usd_volume.is_finite() || mark_min_usd_volume < 0.0 {
            return Err(AppError::InvalidArgument(
                "markMinUsdVolume must be a finite non-negative number".to_string(),
            ));
        }

        Ok(StreamConfig {
            endpoint_url,
            reconnect_delay_ms,
            resubscribe_grace_ms,
            live_refresh_interval_ms,
            mark_min_usd_volume,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum Category {
    Recent,
    AboutToGraduate,
    Graduated,
}

impl Category {
    pub fn default_sort(self) -> SortSpec {
        match self {
            Self::Recent => SortSpec::new(SortField::CreatedAt, SortDirection::Desc),
            Self::AboutToGraduate => SortSpec::new(SortField::BondingCurve, SortDirection::Desc),
            Self::Graduated => SortSpec::new(SortField::GraduatedAt, SortDirection::Desc),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SortField {
    CreatedAt,
    BondingCurve,
    Volume24h,
    MarketCap,
    Liquidity,
    GraduatedAt,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SortSpec {
    pub field: SortField,
    pub direction: SortDirection,
}

impl SortSpec {
    pub const fn new(field: SortField, direction: SortDirection) -> Self {
        Self { field, direction }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct BaseAsset {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub launchpad: Option<String>,
    #[serde(default)]
    pub dev: Option<String>,
    #[serde(default)]
    pub circ_supply: Option<f64>,
    #[serde(default)]
    pub mcap: Option<f64>,
    #[serde(default)]
    pub usd_price: Option<f64>,
    #[serde(default)]
    pub holder_count: Option<u64>,
    #[serde(default)]
    pub graduated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub graduated_pool: Option<String>,
}

impl BaseAsset {
    pub fn is_graduated(&self) -> bool {
        self.graduated_pool.is_some() || self.graduated_at.is_some()
    }

    fn merge_from(&mut self, incoming: &BaseAsset) {
        merge_field(&mut self.name, &incoming.name);
        merge_field(&mut self.symbol, &incoming.symbol);
        merge_field(&mut self.launchpad, &incoming.launchpad);
        merge_field(&mut self.dev, &incoming.dev);
        merge_field(&mut self.circ_supply, &incoming.circ_supply);
        merge_field(&mut self.mcap, &incoming.mcap);
        merge_field(&mut self.usd_price, &incoming.usd_price);
        merge_field(&mut self.holder_count, &incoming.holder_count);
        merge_field(&mut self.graduated_at, &incoming.graduated_at);
        merge_field(&mut self.graduated_pool, &incoming.graduated_pool);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Pool {
    pub id: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub bonding_curve: Option<f64>,
    #[serde(default)]
    pub volume24h: Option<f64>,
    #[serde(default)]
    pub liquidity: Option<f64>,
    #[serde(default)]
    pub is_unreliable: Option<bool>,
    pub base_asset: BaseAsset,
    /// Set only when the pool entered a list from the live stream.
    #[serde(default, skip_deserializing)]
    pub streamed: bool,
}

fn merge_field<T: Clone>(target: &mut Option<T>, incoming: &Option<T>) {
    if let Some(value) = incoming {
        *target = Some(value.clone());
    }
}

impl Pool {
    pub fn is_unreliable(&self) -> bool {
        self.is_unreliable.unwrap_or(false)
    }

    pub fn merge_from(&mut self, incoming: &Pool) {
        merge_field(&mut self.created_at, &incoming.created_at);
        merge_field(&mut self.updated_at, &incoming.updated_at);
        merge_field(&mut self.bonding_curve, &incoming.bonding_curve);
        merge_field(&mut self.volume24h, &incoming.volume24h);
        merge_field(&mut self.liquidity, &incoming.liquidity);
        merge_field(&mut self.is_unreliable, &incoming.is_unreliable);
        self.base_asset.merge_from(&incoming.base_asset);
    }

    pub fn streamed_copy(incoming: &Pool) -> Self {
        Self {
            streamed: true,
            ..incoming.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PoolUpdate {
    New(Pool),
    Update(Pool),
    Graduated(Pool),
}

impl PoolUpdate {
    pub fn pool(&self) -> &Pool {
        match self {
            Self::New(pool) | Self::Update(pool) | Self::Graduated(pool) => pool,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PoolUpdateWire {
    #[serde(rename = "type")]
    pub kind: String,
    pub pool: Pool,
}

impl TryFrom<PoolUpdateWire> for PoolUpdate {
    type Error = AppError;

    fn try_from(value: PoolUpdateWire) -> Result<Self, Self::Error> {
        match value.kind.as_str() {
            "new" => Ok(Self::New(value.pool)),
            "update" => Ok(Self::Update(value.pool)),
            "graduated" => Ok(Self::Graduated(value.pool)),
            other => Err(AppError::UnknownMessageType(format!(
                "pool update '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub id: String,
    pub asset_id: String,
    pub trader_address: String,
    #[serde(rename = "type")]
    pub side: TradeSide,
    pub usd_price: f64,
    pub usd_volume: f64,
    pub amount: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_valid: Option<bool>,
    #[serde(default)]
    pub is_mev: Option<bool>,
}

impl Trade {
    pub fn is_valid(&self) -> bool {
        self.is_valid.unwrap_or(true)
    }

    pub fn is_mev(&self) -> bool {
        self.is_mev.unwrap_or(false)
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PriceTick {
    pub block_id: u64,
    pub asset_id: String,
    pub price: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bar {
    /// Bucket start, unix milliseconds.
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Resolution {
    #[serde(rename = "1S")]
    S1,
    #[serde(rename = "15S")]
    S15,
    #[serde(rename = "30S")]
    S30,
    #[serde(rename = "1")]
    M1,
    #[serde(rename = "5")]
    M5,
    #[serde(rename = "15")]
    M15,
    #[serde(rename = "30")]
    M30,
    #[serde(rename = "60")]
    H1,
    #[serde(rename = "240")]
    H4,
    #[serde(rename = "720")]
    H12,
    #[serde(rename = "1D")]
    D1,
}

impl Resolution {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::S1 => "1S",
            Self::S15 => "15S",
            Self::S30 => "30S",
            Self::M1 => "1",
            Self::M5 => "5",
            Self::M15 => "15",
            Self::M30 => "30",
            Self::H1 => "60",
            Self::H4 => "240",
            Self::H12 => "720",
            Self::D1 => "1D",
        }
    }

    pub fn parse_str(value: &str) -> Option<Self> {
        match value {
            "1S" => Some(Self::S1),
            "15S" => Some(Self::S15),
            "30S" => Some(Self::S30),
            "1" => Some(Self::M1),
            "5" => Some(Self::M5),
            "15" => Some(Self::M15),
            "30" => Some(Self::M30),
            "60" => Some(Self::H1),
            "240" => Some(Self::H4),
            "720" => Some(Self::H12),
            "1D" | "D" => Some(Self::D1),
            _ => None,
        }
    }

    pub fn duration_ms(self) -> i64 {
        match self {
            Self::S1 => 1_000,
            Self::S15 => 15_000,
            Self::S30 => 30_000,
            Self::M1 => 60_000,
            Self::M5 => 300_000,
            Self::M15 => 900_000,
            Self::M30 => 1_800_000,
            Self::H1 => 3_600_000,
            Self::H4 => 14_400_000,
            Self::H12 => 43_200_000,
            Self::D1 => 86_400_000,
        }
    }

    pub fn is_live_refreshed(self) -> bool {
        matches!(self, Self::H1 | Self::H4 | Self::H12 | Self::D1)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum PriceMode {
    #[default]
    Price,
    MarketCap,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Mark {
    pub id: String,
    /// Unix seconds.
    pub time: i64,
    pub color: String,
    pub label: String,
    pub text: String,
    pub label_font_color: String,
    pub min_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RecentFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launchpads: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    #[serde(rename = "subscribe:pool")]
    SubscribePools { pools: Vec<String> },
    #[serde(rename = "unsubscribe:pool")]
    UnsubscribePools { pools: Vec<String> },
    #[serde(rename = "subscribe:txns")]
    SubscribeTxns { assets: Vec<String> },
    #[serde(rename = "unsubscribe:txns")]
    UnsubscribeTxns { assets: Vec<String> },
    #[serde(rename = "subscribe:recent")]
    SubscribeRecent {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filters: Option<RecentFilters>,
    },
    #[serde(rename = "unsubscribe:recent")]
    UnsubscribeRecent,
}

impl OutboundMessage {
    pub fn encode(&self) -> Result<String, AppError> {
        Ok(simd_json::serde::to_string(self)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageTag {
    Updates,
    Actions,
    Prices,
}

impl MessageTag {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Updates => "updates",
            Self::Actions => "actions",
            Self::Prices => "prices",
        }
    }

    pub fn parse_str(value: &str) -> Result<Self, AppError> {
        match value {
            "updates" => Ok(Self::Updates),
            "actions" => Ok(Self::Actions),
            "prices" => Ok(Self::Prices),
            other => Err(AppError::UnknownMessageType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Updates(Vec<PoolUpdate>),
    Actions(Vec<Trade>),
    Prices(Vec<PriceTick>),
}

impl InboundMessage {
    pub fn tag(&self) -> MessageTag {
        match self {
            Self::Updates(_) => MessageTag::Updates,
            Self::Actions(_) => MessageTag::Actions,
            Self::Prices(_) => MessageTag::Prices,
        }
    }
}

#[derive(Debug, Deserialize)]
struct InboundEnvelopeWire {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<simd_json::OwnedValue>,
}

fn decode_data<T>(data: Option<simd_json::OwnedValue>) -> Result<Vec<T>, AppError>
where
    T: serde::de::DeserializeOwned,
{
    match data {
        Some(value) => Ok(simd_json::serde::from_owned_value(value)?),
        None => Ok(Vec::new()),
    }
}

/// Decodes one inbound frame. Unknown top-level tags are an
/// `UnknownMessageType` error; unknown pool-update kinds are dropped from the
/// batch with a warning.
pub fn parse_inbound_payload(payload: &mut [u8]) -> Result<InboundMessage, AppError> {
    let envelope: InboundEnvelopeWire = simd_json::serde::from_slice(payload)?;
    match MessageTag::parse_str(&envelope.kind)? {
        MessageTag::Updates => {
            let wires: Vec<PoolUpdateWire> = decode_data(envelope.data)?;
            let mut updates = Vec::with_capacity(wires.len());
            for wire in wires {
                let pool_id = wire.pool.id.clone();
                match PoolUpdate::try_from(wire) {
                    Ok(update) => updates.push(update),
                    Err(error) => warn!(%pool_id, %error, "ignoring pool update"),
                }
            }
            Ok(InboundMessage::Updates(updates))
        }
        MessageTag::Actions => Ok(InboundMessage::Actions(decode_data(envelope.data)?)),
        MessageTag::Prices => Ok(InboundMessage::Prices(decode_data(envelope.data)?)),
    }
}
