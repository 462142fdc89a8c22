//! Live push channel.
//!
//! Not a pub/sub off the ingest path: each connection tails the store with
//! its own cursor, so storage failures degrade live delivery without
//! coupling it to the write pipeline. Ordering is monotonic per
//! connection; duplicates are allowed (at-least-once).

use std::collections::VecDeque;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::model::MetricRow;

use super::QueryContext;

/// Rows fetched per poll; a deep backlog trickles out over several ticks.
const POLL_FETCH_LIMIT: u32 = 500;
/// Send budget per tick; a slow reader spills into the bounded buffer.
const FLUSH_BUDGET: Duration = Duration::from_millis(250);
/// Drain budget when the server side closes.
const DRAIN_DEADLINE: Duration = Duration::from_secs(2);
const MAX_MISSED_HEARTBEATS: u32 = 2;

#[derive(Debug, Deserialize)]
pub struct LiveParams {
    pub service: Option<String>,
}

#[derive(serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum LiveFrame<'a> {
    Metric { data: &'a MetricRow },
    Dropped { dropped: u64 },
}

pub async fn ws_handler(
    State(ctx): State<QueryContext>,
    Query(params): Query<LiveParams>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| connection(ctx, params.service, socket))
}

async fn connection(ctx: QueryContext, service: Option<String>, socket: WebSocket) {
    let _guard = ctx.metrics.live_connection_guard();
    info!(service = service.as_deref().unwrap_or("*"), "live connection opened");

    let (mut sink, mut stream) = socket.split();
    let capacity = ctx.config.live.buffer.max(1);
    let mut buffer: VecDeque<Message> = VecDeque::with_capacity(capacity);
    let mut cursor = Utc::now().timestamp_millis();
    let mut missed_heartbeats = 0u32;

    let mut poll = time::interval(ctx.config.live.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut heartbeat = time::interval(ctx.config.live.heartbeat);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick of an interval fires immediately; spend it here so
    // the first heartbeat goes out a full period after connect.
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = poll.tick() => {
                match ctx.store.rows_since(service.as_deref(), cursor, POLL_FETCH_LIMIT).await {
                    Ok(rows) => {
                        if let Some(last) = rows.last() {
                            cursor = last.timestamp + 1;
                        }
                        let dropped = enqueue_rows(&mut buffer, capacity, &rows);
                        if dropped > 0 {
                            // One control frame per overflow window; the
                            // connection stays open.
                            if buffer.len() >= capacity {
                                buffer.pop_front();
                            }
                            buffer.push_back(frame(&LiveFrame::Dropped { dropped }));
                            ctx.metrics.add_live_dropped(dropped);
                            debug!(dropped, "live buffer overflow");
                        }
                    }
                    Err(err) => warn!(error = %err, "live tail query failed"),
                }
                if !flush(&mut sink, &mut buffer, FLUSH_BUDGET).await {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                missed_heartbeats += 1;
                if missed_heartbeats > MAX_MISSED_HEARTBEATS {
                    info!("closing silent live connection");
                    break;
                }
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            incoming = recv(&mut stream) => {
                match incoming {
                    Incoming::Alive => missed_heartbeats = 0,
                    Incoming::Gone => break,
                }
            }
        }
    }

    // Server-side close drains what the peer will still take.
    let _ = time::timeout(DRAIN_DEADLINE, async {
        let _ = flush(&mut sink, &mut buffer, DRAIN_DEADLINE).await;
        let _ = sink.send(Message::Close(None)).await;
    })
    .await;
    info!("live connection closed");
}

fn frame(payload: &LiveFrame<'_>) -> Message {
    Message::Text(serde_json::to_string(payload).unwrap_or_default())
}

/// Enqueue rows with drop-oldest overflow; returns the number dropped.
fn enqueue_rows(buffer: &mut VecDeque<Message>, capacity: usize, rows: &[MetricRow]) -> u64 {
    let mut dropped = 0;
    for row in rows {
        if buffer.len() >= capacity {
            buffer.pop_front();
            dropped += 1;
        }
        buffer.push_back(frame(&LiveFrame::Metric { data: row }));
    }
    dropped
}

/// Send buffered frames until empty, the peer fails, or the budget runs
/// out. Frames that miss the budget stay queued for the next tick.
async fn flush(
    sink: &mut SplitSink<WebSocket, Message>,
    buffer: &mut VecDeque<Message>,
    budget: Duration,
) -> bool {
    let result = time::timeout(budget, async {
        while let Some(next) = buffer.pop_front() {
            sink.send(next).await?;
        }
        Ok::<_, axum::Error>(())
    })
    .await;
    match result {
        Ok(Ok(())) => true,
        Ok(Err(_)) => false,
        Err(_) => true,
    }
}

enum Incoming {
    Alive,
    Gone,
}

async fn recv(stream: &mut SplitStream<WebSocket>) -> Incoming {
    match stream.next().await {
        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => Incoming::Gone,
        // Pongs and any client traffic count as liveness.
        Some(Ok(_)) => Incoming::Alive,
    }
}
