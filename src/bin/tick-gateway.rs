//! Local binary feed for development: streams one market-data frame every 100ms
//! to each connected client.

use futures_util::SinkExt;
use std::net::SocketAddr;
use std::time::Duration;
use tick_pipeline_lib::market::decoder::{ExchangeId, MarketDataFrame};
use tick_pipeline_lib::market::now_unix_ms;
use tick_pipeline_lib::market::types::Side;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_GATEWAY_ADDR: &str = "127.0.0.1:8080";
const GATEWAY_ADDR_ENV: &str = "TICK_GATEWAY_ADDR";
const FRAME_INTERVAL_MS: u64 = 100;
// Fixed-point: 50000.00000000, climbing by 100 raw units per frame.
const START_PRICE_RAW: i64 = 5_000_000_000_000;
const PRICE_STEP_RAW: i64 = 100;
const QUANTITY_RAW: u64 = 100_000_000;
const SYMBOL_ID: u32 = 1;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let addr = std::env::var(GATEWAY_ADDR_ENV)
        .ok()
        .and_then(|value| value.parse::<SocketAddr>().ok())
        .unwrap_or_else(|| {
            DEFAULT_GATEWAY_ADDR
                .parse()
                .unwrap_or(SocketAddr::from(([127, 0, 0, 1], 8080)))
        });

    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(bind_error) => {
            error!(%addr, error = %bind_error, "failed to bind gateway");
            std::process::exit(1);
        }
    };
    info!(%addr, "tick gateway listening");

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(accept_error) => {
                warn!(error = %accept_error, "accept failed");
                continue;
            }
        };
        tokio::spawn(serve_client(stream, peer_addr));
    }
}

async fn serve_client(stream: TcpStream, peer_addr: SocketAddr) {
    let mut ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(handshake_error) => {
            error!(%peer_addr, error = %handshake_error, "websocket handshake failed");
            return;
        }
    };
    info!(%peer_addr, "client connected");

    let mut ticker = tokio::time::interval(Duration::from_millis(FRAME_INTERVAL_MS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut counter: u64 = 0;

    loop {
        ticker.tick().await;

        let frame = gateway_frame(counter, now_unix_ms());
        if let Err(send_error) = ws_stream.send(Message::Binary(frame.to_bytes().to_vec())).await {
            info!(%peer_addr, error = %send_error, "client disconnected");
            return;
        }
        counter = counter.wrapping_add(1);
    }
}

fn gateway_frame(counter: u64, timestamp: i64) -> MarketDataFrame {
    let step = i64::try_from(counter).unwrap_or(i64::MAX / PRICE_STEP_RAW);
    MarketDataFrame {
        timestamp: timestamp.max(0) as u64,
        exchange_id: ExchangeId::Binance,
        symbol_id: SYMBOL_ID,
        side: if counter % 2 == 0 { Side::Buy } else { Side::Sell },
        price: START_PRICE_RAW.saturating_add(step.saturating_mul(PRICE_STEP_RAW)),
        quantity: QUANTITY_RAW,
        is_snapshot: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tick_pipeline_lib::market::decoder::decode_market_data;

    #[test]
    fn price_climbs_by_one_hundred_raw_units_per_frame() {
        let first = gateway_frame(0, 1_700_000_000_000);
        assert_eq!(first.price, START_PRICE_RAW);
        assert_eq!(first.side, Side::Buy);

        let mut previous = first;
        for counter in 1..50 {
            let frame = gateway_frame(counter, 1_700_000_000_000);
            assert_eq!(frame.price - previous.price, PRICE_STEP_RAW);
            assert_ne!(frame.side, previous.side);
            previous = frame;
        }
    }

    #[test]
    fn gateway_frames_decode_with_unit_quantity() {
        let tick = decode_market_data(&gateway_frame(3, 1_700_000_000_000).to_bytes())
            .expect("gateway frame decodes");
        assert_eq!(tick.quantity, 1.0);
        assert_eq!(tick.side, Side::Sell);
        assert!(tick.price > 50_000.0);
    }
}
