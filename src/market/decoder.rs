//! Little-endian, 31 bytes, eight-decimal fixed point:
//! `timestamp u64 | exchange u8 | symbol u32 | side u8 | price i64 | quantity u64 | snapshot u8`.

use crate::market::types::{Side, Tick};
use thiserror::Error;

pub const MARKET_DATA_FRAME_LEN: usize = 31;
const FIXED_POINT_SCALE: f64 = 100_000_000.0;
const SIDE_BUY: u8 = 1;
const SIDE_SELL: u8 = 2;

pub type Decoder = fn(&[u8]) -> Result<Tick, DecodeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeCause {
    #[error("frame shorter than {MARKET_DATA_FRAME_LEN} bytes")]
    TooShort,
    #[error("unknown side byte {0}")]
    InvalidSide(u8),
    #[error("price must be positive")]
    NonPositivePrice,
    #[error("quantity must be positive")]
    NonPositiveQuantity,
    #[error("timestamp does not fit signed 64-bit millis")]
    TimestampOverflow,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot decode {len}-byte payload: {cause}")]
pub struct DecodeError {
    pub len: usize,
    pub cause: DecodeCause,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExchangeId {
    Binance = 1,
    Bybit = 2,
    Coinbase = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarketDataFrame {
    pub timestamp: u64,
    pub exchange_id: ExchangeId,
    pub symbol_id: u32,
    pub side: Side,
    pub price: i64,
    pub quantity: u64,
    pub is_snapshot: u8,
}

impl MarketDataFrame {
    pub fn from_tick(tick: &Tick, exchange_id: ExchangeId, symbol_id: u32) -> Self {
        Self {
            timestamp: tick.timestamp.max(0) as u64,
            exchange_id,
            symbol_id,
            side: tick.side,
            price: (tick.price * FIXED_POINT_SCALE).round() as i64,
            quantity: (tick.quantity * FIXED_POINT_SCALE).round().max(0.0) as u64,
            is_snapshot: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; MARKET_DATA_FRAME_LEN] {
        let mut buf = [0u8; MARKET_DATA_FRAME_LEN];
        buf[0..8].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[8] = self.exchange_id as u8;
        buf[9..13].copy_from_slice(&self.symbol_id.to_le_bytes());
        buf[13] = match self.side {
            Side::Buy => SIDE_BUY,
            Side::Sell => SIDE_SELL,
        };
        buf[14..22].copy_from_slice(&self.price.to_le_bytes());
        buf[22..30].copy_from_slice(&self.quantity.to_le_bytes());
        buf[30] = self.is_snapshot;
        buf
    }
}

fn read_u64_le(data: &[u8], start: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[start..start + 8]);
    u64::from_le_bytes(bytes)
}

fn read_i64_le(data: &[u8], start: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[start..start + 8]);
    i64::from_le_bytes(bytes)
}

/// Decodes one binary frame. Trailing bytes past the fixed layout are ignored.
pub fn decode_market_data(data: &[u8]) -> Result<Tick, DecodeError> {
    let fail = |cause| DecodeError {
        len: data.len(),
        cause,
    };

    if data.len() < MARKET_DATA_FRAME_LEN {
        return Err(fail(DecodeCause::TooShort));
    }

    let timestamp =
        i64::try_from(read_u64_le(data, 0)).map_err(|_| fail(DecodeCause::TimestampOverflow))?;

    let side = match data[13] {
        SIDE_BUY => Side::Buy,
        SIDE_SELL => Side::Sell,
        other => return Err(fail(DecodeCause::InvalidSide(other))),
    };

    let price_raw = read_i64_le(data, 14);
    if price_raw <= 0 {
        return Err(fail(DecodeCause::NonPositivePrice));
    }

    let quantity_raw = read_u64_le(data, 22);
    if quantity_raw == 0 {
        return Err(fail(DecodeCause::NonPositiveQuantity));
    }

    Ok(Tick {
        timestamp,
        price: price_raw as f64 / FIXED_POINT_SCALE,
        quantity: quantity_raw as f64 / FIXED_POINT_SCALE,
        side,
    })
}
