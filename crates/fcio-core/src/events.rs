use crate::request::BusySource;
use fcio_proto::PortId;
use std::fmt;
use tracing::{info, warn};

/// Condition observed on a single completed request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoEvent {
    QueueFull,
    DeviceBusy,
    CheckCondition { sense_key: u8, asc: u8, ascq: u8 },
    TransportBusy(BusySource),
    /// A read moved less data than the target reported.
    ReadCheckError { reported: u32, observed: u32 },
}

impl IoEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            IoEvent::QueueFull => "queue_full",
            IoEvent::DeviceBusy => "device_busy",
            IoEvent::CheckCondition { .. } => "check_condition",
            IoEvent::TransportBusy(_) => "transport_busy",
            IoEvent::ReadCheckError { .. } => "read_check_error",
        }
    }
}

/// A queue depth adjustment. `lun` is `None` for the target ceiling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DepthChange {
    pub target: PortId,
    pub lun: Option<u64>,
    pub old: u32,
    pub new: u32,
}

/// Notification for the management plane.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MgmtEvent {
    Io {
        target: PortId,
        lun: u64,
        opcode: u8,
        event: IoEvent,
    },
    QueueDepthChanged(DepthChange),
    LunReset {
        target: PortId,
        lun: u64,
        success: bool,
    },
    TargetReset {
        target: PortId,
        success: bool,
    },
    BusReset {
        targets: usize,
        success: bool,
    },
}

impl MgmtEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            MgmtEvent::Io { event, .. } => event.as_str(),
            MgmtEvent::QueueDepthChanged(_) => "queue_depth_changed",
            MgmtEvent::LunReset { .. } => "lun_reset",
            MgmtEvent::TargetReset { .. } => "target_reset",
            MgmtEvent::BusReset { .. } => "bus_reset",
        }
    }
}

impl fmt::Display for MgmtEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MgmtEvent::Io {
                target,
                lun,
                opcode,
                event,
            } => {
                write!(f, "{} target={target} lun={lun} opcode={opcode:#04x}", event.as_str())?;
                match event {
                    IoEvent::CheckCondition {
                        sense_key,
                        asc,
                        ascq,
                    } => write!(f, " key={sense_key:#x} asc={asc:#04x} ascq={ascq:#04x}"),
                    IoEvent::TransportBusy(source) => write!(f, " source={}", source.as_str()),
                    IoEvent::ReadCheckError { reported, observed } => {
                        write!(f, " reported={reported} observed={observed}")
                    }
                    IoEvent::QueueFull | IoEvent::DeviceBusy => Ok(()),
                }
            }
            MgmtEvent::QueueDepthChanged(change) => {
                write!(f, "queue_depth_changed target={}", change.target)?;
                if let Some(lun) = change.lun {
                    write!(f, " lun={lun}")?;
                }
                write!(f, " {} -> {}", change.old, change.new)
            }
            MgmtEvent::LunReset {
                target,
                lun,
                success,
            } => write!(f, "lun_reset target={target} lun={lun} success={success}"),
            MgmtEvent::TargetReset { target, success } => {
                write!(f, "target_reset target={target} success={success}")
            }
            MgmtEvent::BusReset { targets, success } => {
                write!(f, "bus_reset targets={targets} success={success}")
            }
        }
    }
}

/// Consumer of management events. Called from the deferred worker, never
/// from the completion path.
pub trait EventSink: Send + Sync {
    fn post(&self, event: MgmtEvent);
}

/// Writes events to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn post(&self, event: MgmtEvent) {
        info!(kind = event.kind(), "{event}");
    }
}

/// Forwards events over a bounded channel; drops them when the reader lags.
#[derive(Clone, Debug)]
pub struct ChannelEventSink {
    tx: async_channel::Sender<MgmtEvent>,
}

impl ChannelEventSink {
    pub fn bounded(capacity: usize) -> (Self, async_channel::Receiver<MgmtEvent>) {
        let (tx, rx) = async_channel::bounded(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn post(&self, event: MgmtEvent) {
        if let Err(err) = self.tx.try_send(event) {
            warn!(kind = err.into_inner().kind(), "dropping management event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port() -> PortId {
        PortId::new(0x010203).unwrap()
    }

    #[test]
    fn display_includes_depth_transition() {
        let event = MgmtEvent::QueueDepthChanged(DepthChange {
            target: port(),
            lun: Some(2),
            old: 30,
            new: 29,
        });
        assert_eq!(
            event.to_string(),
            "queue_depth_changed target=010203 lun=2 30 -> 29"
        );
    }

    #[test]
    fn channel_sink_drops_when_full() {
        let (sink, rx) = ChannelEventSink::bounded(1);
        sink.post(MgmtEvent::TargetReset {
            target: port(),
            success: true,
        });
        sink.post(MgmtEvent::BusReset {
            targets: 1,
            success: true,
        });
        assert_eq!(rx.len(), 1);
        assert_eq!(rx.try_recv().unwrap().kind(), "target_reset");
    }
}
