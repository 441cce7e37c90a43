use core::time::Duration;

use futures::{
    channel::mpsc::{self, UnboundedReceiver, UnboundedSender},
    StreamExt as _,
};
use log::{debug, warn};
use reqwest::{header::ACCEPT, Client};
use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr};
use strum::{AsRefStr, Display, EnumString};
use types::primitives::{Epoch, Slot, H256};
use url::Url;

use crate::sse::{SseDecoder, SseFrame};

const RECONNECT_DELAY: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, PartialEq, Eq, Debug, AsRefStr, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Topic {
    Block,
    FinalizedCheckpoint,
}

#[serde_as]
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct BlockEvent {
    #[serde_as(as = "DisplayFromStr")]
    pub slot: Slot,
    pub block: H256,
    #[serde(default)]
    pub execution_optimistic: bool,
}

#[serde_as]
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct FinalizedCheckpointEvent {
    pub block: H256,
    pub state: H256,
    #[serde_as(as = "DisplayFromStr")]
    pub epoch: Epoch,
    #[serde(default)]
    pub execution_optimistic: bool,
}

#[derive(Clone, Copy, Debug)]
pub enum BeaconEvent {
    Block(BlockEvent),
    FinalizedCheckpoint(FinalizedCheckpointEvent),
}

/// Handle to a running event subscription.
///
/// The backing task reconnects with a delay after stream errors and reports
/// connection state on `ready`. Dropping both receivers stops the task.
pub struct EventStream {
    pub events: UnboundedReceiver<BeaconEvent>,
    pub ready: UnboundedReceiver<bool>,
}

impl EventStream {
    pub(crate) fn spawn(client: Client, events_url: Url) -> Self {
        let (events_tx, events) = mpsc::unbounded();
        let (ready_tx, ready) = mpsc::unbounded();

        tokio::spawn(run_event_stream(client, events_url, events_tx, ready_tx));

        Self { events, ready }
    }
}

#[must_use]
pub(crate) fn events_url(base: &Url, topics: &[Topic]) -> Result<Url, url::ParseError> {
    let topics = topics
        .iter()
        .map(Topic::as_ref)
        .collect::<Vec<_>>()
        .join(",");

    let mut url = base.join("eth/v1/events")?;
    url.set_query(Some(&format!("topics={topics}")));
    Ok(url)
}

async fn run_event_stream(
    client: Client,
    events_url: Url,
    events_tx: UnboundedSender<BeaconEvent>,
    ready_tx: UnboundedSender<bool>,
) {
    loop {
        let response = client
            .get(events_url.clone())
            .header(ACCEPT, mime::TEXT_EVENT_STREAM.as_ref())
            .send()
            .await
            .and_then(|response| response.error_for_status());

        match response {
            Ok(response) => {
                if ready_tx.unbounded_send(true).is_err() {
                    return;
                }

                let mut decoder = SseDecoder::default();
                let mut body = response.bytes_stream();

                while let Some(chunk) = body.next().await {
                    let bytes = match chunk {
                        Ok(bytes) => bytes,
                        Err(error) => {
                            warn!("event stream read failed: {error}");
                            break;
                        }
                    };

                    for frame in decoder.decode(&bytes) {
                        let Some(event) = parse_event(&frame) else {
                            continue;
                        };

                        if events_tx.unbounded_send(event).is_err() {
                            return;
                        }
                    }
                }

                debug!("event stream disconnected");
            }
            Err(error) => warn!("event stream connection failed: {error}"),
        }

        if ready_tx.unbounded_send(false).is_err() {
            return;
        }

        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

fn parse_event(frame: &SseFrame) -> Option<BeaconEvent> {
    let topic = frame.event.parse::<Topic>().ok()?;

    let event = match topic {
        Topic::Block => serde_json::from_str(&frame.data).map(BeaconEvent::Block),
        Topic::FinalizedCheckpoint => {
            serde_json::from_str(&frame.data).map(BeaconEvent::FinalizedCheckpoint)
        }
    };

    match event {
        Ok(event) => Some(event),
        Err(error) => {
            warn!("invalid {topic} event: {error} (data: {:?})", frame.data);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;

    #[test]
    fn events_url_includes_requested_topics() -> Result<()> {
        let base = "http://localhost:5052/".parse::<Url>()?;
        let url = events_url(&base, &[Topic::Block, Topic::FinalizedCheckpoint])?;

        assert_eq!(
            url.as_str(),
            "http://localhost:5052/eth/v1/events?topics=block,finalized_checkpoint",
        );

        Ok(())
    }

    #[test]
    fn block_event_frame_is_parsed() {
        let frame = SseFrame {
            event: "block".to_owned(),
            data: r#"{
                "slot": "100",
                "block": "0xabababababababababababababababababababababababababababababababab"
            }"#
            .to_owned(),
        };

        match parse_event(&frame) {
            Some(BeaconEvent::Block(event)) => {
                assert_eq!(event.slot, 100);
                assert_eq!(event.block, H256::repeat_byte(0xab));
            }
            other => panic!("expected a block event, got {other:?}"),
        }
    }

    #[test]
    fn unknown_topics_are_ignored() {
        let frame = SseFrame {
            event: "chain_reorg".to_owned(),
            data: "{}".to_owned(),
        };

        assert!(parse_event(&frame).is_none());
    }

    #[test]
    fn malformed_event_data_is_ignored() {
        let frame = SseFrame {
            event: "block".to_owned(),
            data: "not json".to_owned(),
        };

        assert!(parse_event(&frame).is_none());
    }
}
