//! Maps raw adapter completion status onto caller-facing results.

use crate::events::IoEvent;
use crate::request::{
    BusySource, CompletionResult, DataDirection, HostStatus, ProtocolFault, SENSE_BUFFER_LEN,
};
use crate::ring::RawCompletion;
use crate::target::TargetCounter;
use fcio_proto::{FcpRsp, IoStatus, RejectReason, RspFlags, scsi_status};

/// Why the engine cancelled a request before it completed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortCause {
    /// The caller's timer fired.
    Timeout,
    /// Swept after a task-management reset.
    Reset,
}

/// What the request context contributes to classification.
#[derive(Clone, Copy, Debug)]
pub struct ClassifyContext {
    pub direction: DataDirection,
    pub length: u32,
    pub underflow: u32,
    pub task_mgmt: bool,
    pub abort: Option<AbortCause>,
    /// The target is still logged in and mapped.
    pub mapped: bool,
}

/// How a completion feeds the queue-depth controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DepthSignal {
    Success,
    ResourceError,
    QueueFull,
    Neutral,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Classified {
    pub status: IoStatus,
    pub result: CompletionResult,
    pub host_status: HostStatus,
    pub scsi_status: u8,
    pub residual: u32,
    pub sense: Vec<u8>,
    pub counter: Option<TargetCounter>,
    pub events: Vec<IoEvent>,
    pub signal: DepthSignal,
}

impl Classified {
    fn new(status: IoStatus, result: CompletionResult) -> Self {
        Self {
            status,
            result,
            host_status: HostStatus::Ok,
            scsi_status: scsi_status::GOOD,
            residual: 0,
            sense: Vec::new(),
            counter: None,
            events: Vec::new(),
            signal: DepthSignal::Neutral,
        }
    }
}

/// Normalize the adapter status: unknown codes are DEFAULT and local rejects
/// raised by the driver itself are DRIVER_REJECT.
pub fn effective_status(raw: &RawCompletion) -> IoStatus {
    match IoStatus::from_raw(raw.status) {
        IoStatus::LocalReject if RejectReason::from_raw(raw.parameter).is_driver() => {
            IoStatus::DriverReject
        }
        status => status,
    }
}

pub fn classify(raw: &RawCompletion, response: Option<&FcpRsp>, ctx: &ClassifyContext) -> Classified {
    let status = effective_status(raw);
    let mut out = match status {
        IoStatus::Success => {
            let mut out = Classified::new(status, CompletionResult::Success { residual: 0 });
            out.signal = DepthSignal::Success;
            out
        }
        IoStatus::FcpRspError => {
            let default_rsp = FcpRsp::default();
            fcp_rsp_error(raw, response.unwrap_or(&default_rsp), ctx)
        }
        IoStatus::NportBusy | IoStatus::FabricBusy => {
            let source = if status == IoStatus::FabricBusy {
                BusySource::Fabric
            } else {
                BusySource::Port
            };
            let mut out = Classified::new(status, CompletionResult::TransportBusy(source));
            out.host_status = HostStatus::TransportDisrupted;
            out.counter = Some(TargetCounter::TransportBusy);
            out.events.push(IoEvent::TransportBusy(source));
            out
        }
        IoStatus::LocalReject => local_reject(status, RejectReason::from_raw(raw.parameter)),
        _ => {
            let reason = RejectReason::from_raw(raw.parameter);
            let mut out = Classified::new(
                status,
                CompletionResult::LocalReject {
                    reason,
                    recoverable: false,
                },
            );
            out.host_status = HostStatus::BusBusy;
            out
        }
    };

    if ctx.abort == Some(AbortCause::Timeout) {
        out.result = CompletionResult::Timeout;
        out.host_status = HostStatus::Aborted;
        out.signal = DepthSignal::Neutral;
    } else if !ctx.mapped {
        out.result = CompletionResult::TransportBusy(BusySource::Port);
        out.host_status = HostStatus::TransportDisrupted;
        out.scsi_status = scsi_status::BUSY;
    }
    out
}

fn local_reject(status: IoStatus, reason: RejectReason) -> Classified {
    let counter = match reason {
        RejectReason::AbortRequested | RejectReason::AbortInProgress => TargetCounter::Abts,
        RejectReason::SequenceTimeout => TargetCounter::SeqTimeout,
        RejectReason::InvalidRpi => TargetCounter::InvalidRpi,
        RejectReason::NoResources | RejectReason::NoXri => TargetCounter::NoResources,
        _ => TargetCounter::RejectOther,
    };
    let recoverable = matches!(
        reason,
        RejectReason::InvalidRpi
            | RejectReason::NoResources
            | RejectReason::AbortRequested
            | RejectReason::SlerCmdRcvFailure
    );
    let mut out = Classified::new(status, CompletionResult::LocalReject { reason, recoverable });
    out.host_status = if recoverable {
        HostStatus::Requeue
    } else {
        HostStatus::BusBusy
    };
    out.counter = Some(counter);
    if matches!(reason, RejectReason::NoResources | RejectReason::NoXri) {
        out.signal = DepthSignal::ResourceError;
    }
    out
}

fn fcp_rsp_error(raw: &RawCompletion, rsp: &FcpRsp, ctx: &ClassifyContext) -> Classified {
    let mut out = Classified::new(IoStatus::FcpRspError, CompletionResult::Success { residual: 0 });
    out.counter = Some(TargetCounter::FcpErr);

    if ctx.task_mgmt {
        // Task management responses carry no SCSI status.
        out.signal = DepthSignal::Success;
        return out;
    }

    if rsp.flags.contains(RspFlags::RSP_LEN_VALID)
        && (!matches!(rsp.rsp_info_len, 0 | 4 | 8) || rsp.rsp_code() != 0)
    {
        out.host_status = HostStatus::BusBusy;
        out.scsi_status = rsp.scsi_status;
        out.result = CompletionResult::ProtocolError {
            status: rsp.scsi_status,
            sense: Vec::new(),
            residual: 0,
            fault: Some(ProtocolFault::InvalidResponseInfo),
        };
        return out;
    }

    out.scsi_status = rsp.scsi_status;
    let sense = rsp.sense_bytes();
    out.sense = sense[..sense.len().min(SENSE_BUFFER_LEN)].to_vec();

    let read = ctx.direction == DataDirection::FromDevice;
    let observed = raw.read_residual;
    let mut fault = None;
    if rsp.flags.contains(RspFlags::RESID_UNDER) {
        out.residual = rsp.residual;
        if read && observed != 0 && observed != rsp.residual {
            out.events.push(IoEvent::ReadCheckError {
                reported: rsp.residual,
                observed,
            });
            out.residual = ctx.length;
            out.host_status = HostStatus::BusBusy;
            fault = Some(ProtocolFault::DroppedFrame);
        } else if out.sense.is_empty()
            && rsp.scsi_status == scsi_status::GOOD
            && ctx.length.saturating_sub(out.residual) < ctx.underflow
        {
            out.host_status = HostStatus::Error;
            fault = Some(ProtocolFault::Underrun);
        }
    } else if rsp.flags.contains(RspFlags::RESID_OVER) {
        out.host_status = HostStatus::Error;
        fault = Some(ProtocolFault::Overrun);
    } else if read
        && observed != 0
        && matches!(rsp.scsi_status, scsi_status::GOOD | scsi_status::CHECK_CONDITION)
    {
        out.events.push(IoEvent::ReadCheckError {
            reported: 0,
            observed,
        });
        out.residual = ctx.length;
        out.host_status = HostStatus::BusBusy;
        fault = Some(ProtocolFault::DroppedFrame);
    }

    match rsp.scsi_status {
        scsi_status::TASK_SET_FULL => {
            out.events.push(IoEvent::QueueFull);
            out.signal = DepthSignal::QueueFull;
        }
        scsi_status::BUSY => {
            out.events.push(IoEvent::DeviceBusy);
            out.signal = DepthSignal::ResourceError;
        }
        scsi_status::GOOD if fault.is_none() => out.signal = DepthSignal::Success,
        _ => {}
    }
    if !out.sense.is_empty() {
        out.events.push(IoEvent::CheckCondition {
            sense_key: out.sense.get(2).map_or(0, |key| key & 0x0f),
            asc: out.sense.get(12).copied().unwrap_or_default(),
            ascq: out.sense.get(13).copied().unwrap_or_default(),
        });
    }

    out.result = if fault.is_none() && rsp.scsi_status == scsi_status::GOOD {
        CompletionResult::Success {
            residual: out.residual,
        }
    } else {
        CompletionResult::ProtocolError {
            status: rsp.scsi_status,
            sense: out.sense.clone(),
            residual: out.residual,
            fault,
        }
    };
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use fcio_buffers::ExchangeTag;
    use fcio_proto::IOERR_DRVR_MASK;

    fn ctx(direction: DataDirection, length: u32, underflow: u32) -> ClassifyContext {
        ClassifyContext {
            direction,
            length,
            underflow,
            task_mgmt: false,
            abort: None,
            mapped: true,
        }
    }

    fn raw(status: IoStatus) -> RawCompletion {
        RawCompletion::new(ExchangeTag(0x40), status.into())
    }

    #[test]
    fn success_is_good() {
        let out = classify(&raw(IoStatus::Success), None, &ctx(DataDirection::FromDevice, 512, 512));
        assert_eq!(out.result, CompletionResult::Success { residual: 0 });
        assert_eq!(out.host_status, HostStatus::Ok);
        assert_eq!(out.signal, DepthSignal::Success);
        assert!(out.counter.is_none());
    }

    #[test]
    fn residual_under_within_underflow_is_success() {
        let rsp = FcpRsp::with_status(scsi_status::GOOD).residual_under(512);
        let out = classify(
            &raw(IoStatus::FcpRspError),
            Some(&rsp),
            &ctx(DataDirection::ToDevice, 4096, 2048),
        );
        assert_eq!(out.result, CompletionResult::Success { residual: 512 });
        assert_eq!(out.residual, 512);
        assert_eq!(out.host_status, HostStatus::Ok);
        assert_eq!(out.counter, Some(TargetCounter::FcpErr));
    }

    #[test]
    fn residual_under_below_underflow_is_host_error() {
        let rsp = FcpRsp::with_status(scsi_status::GOOD).residual_under(3000);
        let out = classify(
            &raw(IoStatus::FcpRspError),
            Some(&rsp),
            &ctx(DataDirection::ToDevice, 4096, 2048),
        );
        assert_eq!(out.host_status, HostStatus::Error);
        assert!(matches!(
            out.result,
            CompletionResult::ProtocolError {
                fault: Some(ProtocolFault::Underrun),
                ..
            }
        ));
    }

    #[test]
    fn read_residual_mismatch_is_dropped_frame() {
        let rsp = FcpRsp::with_status(scsi_status::GOOD).residual_under(512);
        let mut completion = raw(IoStatus::FcpRspError);
        completion.read_residual = 1024;
        let out = classify(&completion, Some(&rsp), &ctx(DataDirection::FromDevice, 4096, 0));
        assert_eq!(out.host_status, HostStatus::BusBusy);
        assert_eq!(out.residual, 4096);
        assert_eq!(
            out.events,
            vec![IoEvent::ReadCheckError {
                reported: 512,
                observed: 1024
            }]
        );

        // writes never take the dropped frame path
        let out = classify(&completion, Some(&rsp), &ctx(DataDirection::ToDevice, 4096, 0));
        assert_eq!(out.host_status, HostStatus::Ok);
        assert_eq!(out.residual, 512);
    }

    #[test]
    fn read_without_residual_flag_but_adapter_residual_is_dropped_frame() {
        let rsp = FcpRsp::with_status(scsi_status::GOOD);
        let mut completion = raw(IoStatus::FcpRspError);
        completion.read_residual = 8;
        let out = classify(&completion, Some(&rsp), &ctx(DataDirection::FromDevice, 4096, 0));
        assert_eq!(out.host_status, HostStatus::BusBusy);
        assert_eq!(out.residual, 4096);
    }

    #[test]
    fn overrun_is_host_error() {
        let rsp = FcpRsp::with_status(scsi_status::GOOD).residual_over(16);
        let out = classify(&raw(IoStatus::FcpRspError), Some(&rsp), &ctx(DataDirection::FromDevice, 64, 0));
        assert_eq!(out.host_status, HostStatus::Error);
    }

    #[test]
    fn sense_is_capped_and_reported() {
        let mut sense = [0u8; 120];
        sense[0] = 0x70;
        sense[2] = 0x06;
        sense[12] = 0x29;
        sense[13] = 0x00;
        let rsp = FcpRsp::with_status(scsi_status::CHECK_CONDITION).sense(&sense);
        let out = classify(&raw(IoStatus::FcpRspError), Some(&rsp), &ctx(DataDirection::None, 0, 0));
        assert_eq!(out.sense.len(), SENSE_BUFFER_LEN);
        assert_eq!(out.scsi_status, scsi_status::CHECK_CONDITION);
        assert_eq!(
            out.events,
            vec![IoEvent::CheckCondition {
                sense_key: 6,
                asc: 0x29,
                ascq: 0
            }]
        );
        assert_eq!(out.signal, DepthSignal::Neutral);
    }

    #[test]
    fn invalid_response_info_is_bus_busy() {
        let rsp = FcpRsp::with_status(scsi_status::GOOD).response_info(6, 0);
        let out = classify(&raw(IoStatus::FcpRspError), Some(&rsp), &ctx(DataDirection::None, 0, 0));
        assert_eq!(out.host_status, HostStatus::BusBusy);
        let rsp = FcpRsp::with_status(scsi_status::GOOD).response_info(8, 4);
        let out = classify(&raw(IoStatus::FcpRspError), Some(&rsp), &ctx(DataDirection::None, 0, 0));
        assert_eq!(out.host_status, HostStatus::BusBusy);
        let rsp = FcpRsp::with_status(scsi_status::GOOD).response_info(8, 0);
        let out = classify(&raw(IoStatus::FcpRspError), Some(&rsp), &ctx(DataDirection::None, 0, 0));
        assert_eq!(out.host_status, HostStatus::Ok);
    }

    #[test]
    fn task_set_full_and_busy_signal_depth() {
        let rsp = FcpRsp::with_status(scsi_status::TASK_SET_FULL);
        let out = classify(&raw(IoStatus::FcpRspError), Some(&rsp), &ctx(DataDirection::None, 0, 0));
        assert_eq!(out.signal, DepthSignal::QueueFull);
        assert_eq!(out.events, vec![IoEvent::QueueFull]);
        let rsp = FcpRsp::with_status(scsi_status::BUSY);
        let out = classify(&raw(IoStatus::FcpRspError), Some(&rsp), &ctx(DataDirection::None, 0, 0));
        assert_eq!(out.signal, DepthSignal::ResourceError);
        assert_eq!(out.events, vec![IoEvent::DeviceBusy]);
    }

    #[test]
    fn task_mgmt_response_has_no_scsi_status() {
        let rsp = FcpRsp::with_status(scsi_status::CHECK_CONDITION);
        let mut context = ctx(DataDirection::None, 0, 0);
        context.task_mgmt = true;
        let out = classify(&raw(IoStatus::FcpRspError), Some(&rsp), &context);
        assert_eq!(out.scsi_status, scsi_status::GOOD);
        assert_eq!(out.host_status, HostStatus::Ok);
    }

    #[test]
    fn transport_busy_is_disrupted() {
        for (status, source) in [
            (IoStatus::FabricBusy, BusySource::Fabric),
            (IoStatus::NportBusy, BusySource::Port),
        ] {
            let out = classify(&raw(status), None, &ctx(DataDirection::None, 0, 0));
            assert_eq!(out.result, CompletionResult::TransportBusy(source));
            assert_eq!(out.host_status, HostStatus::TransportDisrupted);
            assert_eq!(out.counter, Some(TargetCounter::TransportBusy));
            assert_eq!(out.signal, DepthSignal::Neutral);
        }
    }

    #[test]
    fn local_reject_recoverability() {
        let mut completion = raw(IoStatus::LocalReject);
        completion.parameter = RejectReason::InvalidRpi.raw();
        let out = classify(&completion, None, &ctx(DataDirection::None, 0, 0));
        assert_eq!(out.host_status, HostStatus::Requeue);
        assert_eq!(out.counter, Some(TargetCounter::InvalidRpi));

        completion.parameter = RejectReason::SequenceTimeout.raw();
        let out = classify(&completion, None, &ctx(DataDirection::None, 0, 0));
        assert_eq!(out.host_status, HostStatus::BusBusy);
        assert_eq!(out.counter, Some(TargetCounter::SeqTimeout));

        completion.parameter = RejectReason::NoResources.raw();
        let out = classify(&completion, None, &ctx(DataDirection::None, 0, 0));
        assert_eq!(out.signal, DepthSignal::ResourceError);
    }

    #[test]
    fn driver_rejects_and_unknown_codes_are_bus_busy() {
        let mut completion = raw(IoStatus::LocalReject);
        completion.parameter = IOERR_DRVR_MASK | 0x03;
        assert_eq!(effective_status(&completion), IoStatus::DriverReject);
        let out = classify(&completion, None, &ctx(DataDirection::None, 0, 0));
        assert_eq!(out.host_status, HostStatus::BusBusy);
        assert!(out.counter.is_none());

        let completion = RawCompletion::new(ExchangeTag(1), 0x42);
        assert_eq!(effective_status(&completion), IoStatus::Default);
        let out = classify(&completion, None, &ctx(DataDirection::None, 0, 0));
        assert_eq!(out.host_status, HostStatus::BusBusy);
    }

    #[test]
    fn timeout_abort_overrides_natural_status() {
        let mut context = ctx(DataDirection::None, 0, 0);
        context.abort = Some(AbortCause::Timeout);
        let out = classify(&raw(IoStatus::Success), None, &context);
        assert_eq!(out.result, CompletionResult::Timeout);
        assert_eq!(out.host_status, HostStatus::Aborted);

        context.abort = Some(AbortCause::Reset);
        let mut completion = raw(IoStatus::LocalReject);
        completion.parameter = RejectReason::AbortRequested.raw();
        let out = classify(&completion, None, &context);
        assert_eq!(out.host_status, HostStatus::Requeue);
    }

    #[test]
    fn unmapped_target_is_transport_disrupted() {
        let mut context = ctx(DataDirection::None, 0, 0);
        context.mapped = false;
        let out = classify(&raw(IoStatus::Success), None, &context);
        assert_eq!(out.host_status, HostStatus::TransportDisrupted);
        assert_eq!(out.scsi_status, scsi_status::BUSY);
    }
}
