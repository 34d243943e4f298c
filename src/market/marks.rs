use crate::market::types::{Mark, Trade, TradeSide};
use chrono::{DateTime, Utc};

const BUY_COLOR: &str = "#16a34a";
const SELL_COLOR: &str = "#dc2626";
const DEV_BUY_COLOR: &str = "#7c3aed";
const DEV_SELL_COLOR: &str = "#db2777";
const LABEL_FONT_COLOR: &str = "#ffffff";
const DEV_MARK_SIZE: u32 = 20;
const USER_MARK_SIZE: u32 = 16;

#[derive(Debug, Clone, Default)]
pub struct MarkContext {
    pub dev_address: Option<String>,
    pub user_address: Option<String>,
    pub circ_supply: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkPass {
    Dev,
    User,
}

pub fn filter_mark_trades<'a>(
    trades: &'a [Trade],
    asset_id: &str,
    min_usd_volume: f64,
) -> Vec<&'a Trade> {
    trades
        .iter()
        .filter(|trade| {
            trade.asset_id == asset_id && !trade.is_mev() && trade.usd_volume >= min_usd_volume
        })
        .collect()
}

/// Runs the dev pass and the user pass independently over the same trades; a
/// trade by a dev who is also the current user is marked twice.
pub fn generate_marks(trades: &[&Trade], context: &MarkContext) -> Vec<Mark> {
    let mut marks = Vec::new();
    for (pass, address) in [
        (MarkPass::Dev, context.dev_address.as_deref()),
        (MarkPass::User, context.user_address.as_deref()),
    ] {
        let Some(address) = address else {
            continue;
        };
        marks.extend(
            trades
                .iter()
                .filter(|trade| trade.trader_address == address)
                .map(|trade| build_mark(trade, pass, context.circ_supply)),
        );
    }
    marks
}

fn build_mark(trade: &Trade, pass: MarkPass, circ_supply: Option<f64>) -> Mark {
    let (actor, suffix, label, color, min_size) = match (pass, trade.side) {
        (MarkPass::Dev, TradeSide::Buy) => ("Dev", "dev", "D", DEV_BUY_COLOR, DEV_MARK_SIZE),
        (MarkPass::Dev, TradeSide::Sell) => ("Dev", "dev", "D", DEV_SELL_COLOR, DEV_MARK_SIZE),
        (MarkPass::User, TradeSide::Buy) => ("You", "user", "B", BUY_COLOR, USER_MARK_SIZE),
        (MarkPass::User, TradeSide::Sell) => ("You", "user", "S", SELL_COLOR, USER_MARK_SIZE),
    };
    let verb = match trade.side {
        TradeSide::Buy => "bought",
        TradeSide::Sell => "sold",
    };
    let valuation = match circ_supply {
        Some(supply) => format!("MC {}", format_usd(trade.usd_price * supply)),
        None => format_price(trade.usd_price),
    };

    Mark {
        id: format!("{}-{suffix}", trade.id),
        time: trade.timestamp.timestamp(),
        color: color.to_string(),
        label: label.to_string(),
        text: format!(
            "{actor} {verb} {} for {} at {valuation} on {}",
            format_amount(trade.amount),
            format_usd(trade.usd_volume),
            format_timestamp(&trade.timestamp),
        ),
        label_font_color: LABEL_FONT_COLOR.to_string(),
        min_size,
    }
}

fn trim_decimals(mut text: String) -> String {
    if text.contains('.') {
        while text.ends_with('0') {
            text.pop();
        }
        if text.ends_with('.') {
            text.pop();
        }
    }
    text
}

pub fn format_amount(value: f64) -> String {
    let magnitude = value.abs();
    let (scaled, suffix) = if magnitude >= 1e9 {
        (value / 1e9, "B")
    } else if magnitude >= 1e6 {
        (value / 1e6, "M")
    } else if magnitude >= 1e3 {
        (value / 1e3, "K")
    } else {
        (value, "")
    };
    format!("{}{suffix}", trim_decimals(format!("{scaled:.2}")))
}

pub fn format_usd(value: f64) -> String {
    format!("${}", format_amount(value))
}

pub fn format_price(price: f64) -> String {
    if price <= 0.0 || !price.is_finite() {
        return "$0".to_string();
    }
    if price >= 1.0 {
        return format_usd(price);
    }
    let leading_zeros = (-price.log10()).floor().max(0.0) as usize;
    let decimals = leading_zeros + 4;
    format!("${}", trim_decimals(format!("{price:.decimals$}")))
}

pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.format("%b %d, %H:%M:%S").to_string()
}
