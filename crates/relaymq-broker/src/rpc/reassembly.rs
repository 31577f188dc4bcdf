use std::mem;

use bytes::{Bytes, BytesMut};
use relaymq_message::{Message, Properties};
use relaymq_transport::{Deliver, Frame, Method, ProtocolError};
use tracing::trace;

/// Upper bound of the body buffer reserved up front from a header.
const PREALLOCATE_LIMIT: usize = 1 << 20;

/// A delivery that arrived out of sequence.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReassemblyError {
    /// A frame of the wrong kind arrived mid-delivery.
    #[error(transparent)]
    Frame(#[from] ProtocolError),

    /// Body fragments exceeded the size announced by the header.
    #[error("body overrun: {received} bytes received, header declared {declared}")]
    Overrun { declared: u64, received: u64 },
}

/// One complete inbound delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub deliver: Deliver,
    pub message: Message,
}

/// Outcome of feeding one frame.
#[derive(Debug, PartialEq)]
pub enum Progress {
    Pending,
    Complete(Delivery),
}

#[derive(Debug, Default)]
enum Stage {
    #[default]
    Method,
    Header(Deliver),
    Body {
        deliver: Deliver,
        properties: Properties,
        declared: u64,
        body: BytesMut,
    },
}

/// Rebuilds deliveries from `method → header → body*` frame sequences.
///
/// Frames other than `basic.deliver` are skipped while no delivery is in
/// progress. Once one has started, a frame of the wrong kind or a body
/// longer than announced is an error and the state machine starts over.
#[derive(Debug, Default)]
pub struct Reassembly {
    stage: Stage,
}

impl Reassembly {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no delivery is partially assembled.
    pub fn is_idle(&self) -> bool {
        matches!(self.stage, Stage::Method)
    }

    /// Feed the next frame of the channel.
    pub fn push(&mut self, frame: Frame) -> Result<Progress, ReassemblyError> {
        match (mem::take(&mut self.stage), frame) {
            (Stage::Method, Frame::Method(Method::Deliver(deliver))) => {
                self.stage = Stage::Header(deliver);
                Ok(Progress::Pending)
            }
            (Stage::Method, other) => {
                trace!(frame = other.kind_name(), "skipping frame outside a delivery");
                Ok(Progress::Pending)
            }

            (Stage::Header(deliver), Frame::Header { body_size: 0, properties }) => {
                Ok(Progress::Complete(Delivery {
                    deliver,
                    message: Message::with_properties(Bytes::new(), properties),
                }))
            }
            (Stage::Header(deliver), Frame::Header { body_size, properties }) => {
                let reserve = usize::try_from(body_size)
                    .unwrap_or(PREALLOCATE_LIMIT)
                    .min(PREALLOCATE_LIMIT);
                self.stage = Stage::Body {
                    deliver,
                    properties,
                    declared: body_size,
                    body: BytesMut::with_capacity(reserve),
                };
                Ok(Progress::Pending)
            }
            (Stage::Header(_), other) => Err(unexpected("header", &other)),

            (
                Stage::Body {
                    deliver,
                    properties,
                    declared,
                    mut body,
                },
                Frame::Body(fragment),
            ) => {
                let received = (body.len() + fragment.len()) as u64;
                if received > declared {
                    return Err(ReassemblyError::Overrun { declared, received });
                }
                body.extend_from_slice(&fragment);
                if received == declared {
                    return Ok(Progress::Complete(Delivery {
                        deliver,
                        message: Message::with_properties(body.freeze(), properties),
                    }));
                }
                self.stage = Stage::Body {
                    deliver,
                    properties,
                    declared,
                    body,
                };
                Ok(Progress::Pending)
            }
            (Stage::Body { .. }, other) => Err(unexpected("body", &other)),
        }
    }
}

fn unexpected(expected: &'static str, found: &Frame) -> ReassemblyError {
    ProtocolError::UnexpectedFrame {
        expected,
        found: found.kind_name(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deliver(tag: u64) -> Frame {
        Frame::Method(Method::Deliver(Deliver {
            consumer_tag: "amq.ctag-test".to_string(),
            delivery_tag: tag,
            redelivered: false,
            exchange: String::new(),
            routing_key: "reply".to_string(),
        }))
    }

    fn header(body_size: u64) -> Frame {
        Frame::Header {
            body_size,
            properties: Properties::default().with_correlation_id("c-1"),
        }
    }

    fn body(bytes: &'static [u8]) -> Frame {
        Frame::Body(Bytes::from_static(bytes))
    }

    fn complete(progress: Progress) -> Delivery {
        match progress {
            Progress::Complete(delivery) => delivery,
            Progress::Pending => panic!("expected a complete delivery"),
        }
    }

    #[test]
    fn joins_body_fragments() {
        let mut reassembly = Reassembly::new();
        assert_eq!(reassembly.push(deliver(1)), Ok(Progress::Pending));
        assert_eq!(reassembly.push(header(11)), Ok(Progress::Pending));
        assert_eq!(reassembly.push(body(b"hello ")), Ok(Progress::Pending));
        assert!(!reassembly.is_idle());

        let delivery = complete(reassembly.push(body(b"world")).expect("last fragment"));
        assert_eq!(delivery.deliver.delivery_tag, 1);
        assert_eq!(delivery.message.body_str(), Some("hello world"));
        assert_eq!(
            delivery.message.properties.correlation_id.as_deref(),
            Some("c-1")
        );
        assert!(reassembly.is_idle());
    }

    #[test]
    fn empty_body_completes_at_header() {
        let mut reassembly = Reassembly::new();
        reassembly.push(deliver(2)).expect("method frame");
        let delivery = complete(reassembly.push(header(0)).expect("header frame"));
        assert!(delivery.message.body.is_empty());
    }

    #[test]
    fn skips_noise_between_deliveries() {
        let mut reassembly = Reassembly::new();
        let noise = [
            Frame::Method(Method::Other("basic.consume-ok".to_string())),
            body(b"stale"),
            header(3),
        ];
        for frame in noise {
            assert_eq!(reassembly.push(frame), Ok(Progress::Pending));
            assert!(reassembly.is_idle());
        }
    }

    #[test]
    fn wrong_kind_mid_delivery_resets() {
        let mut reassembly = Reassembly::new();
        reassembly.push(deliver(1)).expect("method frame");
        let err = reassembly.push(body(b"x")).expect_err("body before header");
        assert_eq!(
            err,
            ReassemblyError::Frame(ProtocolError::UnexpectedFrame {
                expected: "header",
                found: "body",
            })
        );
        assert!(reassembly.is_idle());

        reassembly.push(deliver(2)).expect("method frame");
        reassembly.push(header(4)).expect("header frame");
        let err = reassembly.push(deliver(3)).expect_err("method inside body");
        assert!(err.to_string().contains("unexpected method frame"));
    }

    #[test]
    fn overrun_is_rejected() {
        let mut reassembly = Reassembly::new();
        reassembly.push(deliver(1)).expect("method frame");
        reassembly.push(header(3)).expect("header frame");
        let err = reassembly.push(body(b"toolong")).expect_err("overrun");
        assert_eq!(
            err,
            ReassemblyError::Overrun {
                declared: 3,
                received: 7
            }
        );
        assert!(reassembly.is_idle());
    }
}
