//! Builds the command unit, descriptor table and work queue entry for one
//! exchange.

use crate::error::PrepareError;
use crate::request::{DataDirection, ScsiRequest};
use crate::ring::{CommandKind, DmaMapper, DmaSegment, WorkRequest};
use crate::target::TargetContext;
use fcio_buffers::{Exchange, ExchangePool};
use fcio_proto::{
    DataPhase, FCP_CMND_LEN, FCP_RSP_LEN, FcpCmnd, MAX_CDB_LEN, SgEntry, TaskAttribute,
    TaskMgmtFlags,
};
use std::time::Duration;

/// A prepared exchange, ready to submit.
#[derive(Debug)]
pub(crate) struct Prepared {
    pub work: WorkRequest,
    pub mappings: Vec<DmaSegment>,
}

/// Work queue timeout field: whole seconds, 0 when it does not fit and the
/// driver times the exchange itself.
pub fn timeout_field(timeout: Duration) -> u8 {
    u8::try_from(timeout.as_secs()).unwrap_or(0)
}

pub(crate) fn prepare_io<B>(
    pool: &ExchangePool<B>,
    exchange: &mut Exchange<B>,
    request: &ScsiRequest,
    target: &TargetContext,
    mapper: &dyn DmaMapper,
    max_segments: usize,
) -> Result<Prepared, PrepareError> {
    if request.regions.len() > max_segments {
        return Err(PrepareError::TooManySegments {
            segments: request.regions.len(),
            max: max_segments,
        });
    }

    let mut mappings = Vec::with_capacity(request.regions.len());
    for region in &request.regions {
        match mapper.map(region, request.direction) {
            Ok(segment) => mappings.push(segment),
            Err(err) => {
                unmap_all(mapper, &mappings, request.direction);
                return Err(err.into());
            }
        }
    }

    let mut entries = fixed_pair(exchange);
    let mut offset = 0u32;
    for segment in &mappings {
        entries.push(SgEntry {
            offset,
            ..SgEntry::new(segment.bus_addr, segment.len)
        });
        offset = offset.wrapping_add(segment.len);
    }
    mark_last(&mut entries);
    let table_entries = entries.len();
    let inbound = request.direction == DataDirection::FromDevice;
    if let Err(err) = pool.write_table(exchange, entries, inbound) {
        unmap_all(mapper, &mappings, request.direction);
        return Err(err.into());
    }

    let (phase, kind) = match request.direction {
        DataDirection::None => (DataPhase::None, CommandKind::Control),
        DataDirection::ToDevice => (DataPhase::Write, CommandKind::Write),
        DataDirection::FromDevice => (DataPhase::Read, CommandKind::Read),
    };
    let cmnd = FcpCmnd {
        lun: request.lun,
        task_attribute: request.task_attribute,
        task_mgmt: TaskMgmtFlags::empty(),
        phase,
        cdb: request.cdb.padded(),
        fcp_dl: request.length,
    };
    let work = finish(
        exchange,
        cmnd,
        target,
        kind,
        timeout_field(request.timeout),
        if inbound { request.length } else { 0 },
        table_entries,
    );
    Ok(Prepared { work, mappings })
}

pub(crate) fn prepare_task_mgmt<B>(
    pool: &ExchangePool<B>,
    exchange: &mut Exchange<B>,
    target: &TargetContext,
    lun: u64,
    flags: TaskMgmtFlags,
    timeout: Duration,
) -> Result<WorkRequest, PrepareError> {
    let mut entries = fixed_pair(exchange);
    mark_last(&mut entries);
    let table_entries = entries.len();
    pool.write_table(exchange, entries, false)?;
    let cmnd = FcpCmnd {
        lun,
        task_attribute: TaskAttribute::Simple,
        task_mgmt: flags,
        phase: DataPhase::None,
        cdb: [0u8; MAX_CDB_LEN],
        fcp_dl: 0,
    };
    Ok(finish(
        exchange,
        cmnd,
        target,
        CommandKind::Control,
        timeout_field(timeout),
        0,
        table_entries,
    ))
}

fn fixed_pair<B>(exchange: &Exchange<B>) -> Vec<SgEntry> {
    vec![
        SgEntry::new(exchange.cmnd_addr(), FCP_CMND_LEN as u32),
        SgEntry::new(exchange.rsp_addr(), FCP_RSP_LEN as u32),
    ]
}

fn mark_last(entries: &mut [SgEntry]) {
    if let Some(last) = entries.last_mut() {
        last.last = true;
    }
}

fn finish<B>(
    exchange: &mut Exchange<B>,
    cmnd: FcpCmnd,
    target: &TargetContext,
    kind: CommandKind,
    timeout_secs: u8,
    read_check: u32,
    table_entries: usize,
) -> WorkRequest {
    exchange.cmnd_mut().copy_from_slice(&cmnd.encode());
    exchange.rsp_mut().fill(0);
    let params = target.params();
    WorkRequest {
        tag: exchange.tag(),
        target: target.id(),
        context: params.context,
        class: params.class,
        fcp2_recovery: params.fcp2_recovery,
        kind,
        timeout_secs,
        read_check,
        cmnd_addr: exchange.cmnd_addr(),
        rsp_addr: exchange.rsp_addr(),
        table_addr: exchange.table_addr(),
        table_entries,
        cmnd,
    }
}

pub(crate) fn unmap_all(mapper: &dyn DmaMapper, mappings: &[DmaSegment], direction: DataDirection) {
    for segment in mappings {
        mapper.unmap(segment, direction);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DmaError;
    use crate::request::{Cdb, MemoryRegion};
    use crate::ring::IdentityMapper;
    use crate::target::TargetParams;
    use fcio_buffers::{ModernBackend, LegacyBackend, RegistrationError, SglPost, SglRegistrar};
    use fcio_proto::{PortId, SGE_LEN};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    struct NoRegistration;

    impl SglRegistrar for NoRegistration {
        fn post_sgl_block(&self, _block: &[SglPost]) -> Result<(), RegistrationError> {
            Ok(())
        }
    }

    struct FailingMapper {
        fail_at: usize,
        mapped: AtomicUsize,
        unmapped: AtomicUsize,
    }

    impl DmaMapper for FailingMapper {
        fn map(
            &self,
            region: &MemoryRegion,
            _direction: DataDirection,
        ) -> Result<DmaSegment, DmaError> {
            if self.mapped.fetch_add(1, Ordering::SeqCst) == self.fail_at {
                return Err(DmaError {
                    addr: region.addr,
                    len: region.len,
                });
            }
            Ok(DmaSegment {
                bus_addr: region.addr,
                len: region.len,
            })
        }

        fn unmap(&self, _segment: &DmaSegment, _direction: DataDirection) {
            self.unmapped.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn target() -> TargetContext {
        TargetContext::new(
            PortId::new(0x010400).unwrap(),
            TargetParams {
                context: 0x11,
                ..TargetParams::default()
            },
            64,
            8,
            None,
            Instant::now(),
        )
    }

    fn pool() -> ExchangePool<()> {
        let pool = ExchangePool::new(Box::new(ModernBackend::new(0x80)), 4, 8, Duration::ZERO);
        pool.provision(4, &NoRegistration).unwrap();
        pool
    }

    fn read_request(regions: Vec<MemoryRegion>) -> ScsiRequest {
        ScsiRequest::with_data(
            PortId::new(0x010400).unwrap(),
            2,
            Cdb::new(&[0x28, 0, 0, 0, 0, 0, 0, 0, 0x80, 0]).unwrap(),
            DataDirection::FromDevice,
            regions,
        )
        .unwrap()
    }

    #[test]
    fn four_region_read_builds_six_entries() {
        let pool = pool();
        let exchange_ref = pool.acquire(PortId::new(1).unwrap()).unwrap();
        let slot = pool.slot_at(exchange_ref).unwrap();
        let mut exchange = slot.lock();
        let regions = (0..4)
            .map(|i| MemoryRegion::new(0x10_0000 + i * 0x1_0000, 16 * 1024))
            .collect();
        let request = read_request(regions);
        let prepared =
            prepare_io(&pool, &mut exchange, &request, &target(), &IdentityMapper, 8).unwrap();

        let entries = exchange.entries();
        assert_eq!(entries.len(), 6);
        assert_eq!(entries.iter().filter(|entry| entry.last).count(), 1);
        assert!(entries[5].last);
        let offsets: Vec<u32> = entries[2..].iter().map(|entry| entry.offset).collect();
        assert_eq!(offsets, vec![0, 16384, 32768, 49152]);
        let last = SgEntry::decode_sge(&exchange.table()[5 * SGE_LEN..6 * SGE_LEN]).unwrap();
        assert!(last.last);
        assert_eq!(last.len, 16384);

        let cmnd = FcpCmnd::decode(exchange.cmnd()).unwrap();
        assert_eq!(cmnd.fcp_dl, 65536);
        assert_eq!(exchange.cmnd()[28..32], [0x00, 0x01, 0x00, 0x00]);
        assert_eq!(cmnd.phase, DataPhase::Read);
        assert_eq!(prepared.work.kind, CommandKind::Read);
        assert_eq!(prepared.work.read_check, 65536);
        assert_eq!(prepared.work.context, 0x11);
        assert_eq!(prepared.work.table_entries, 6);
        assert_eq!(prepared.mappings.len(), 4);
    }

    #[test]
    fn no_data_marks_response_entry() {
        let pool = pool();
        let exchange_ref = pool.acquire(PortId::new(1).unwrap()).unwrap();
        let slot = pool.slot_at(exchange_ref).unwrap();
        let mut exchange = slot.lock();
        exchange.rsp_mut().fill(0xee);
        let request = ScsiRequest::control(
            PortId::new(0x010400).unwrap(),
            0,
            Cdb::new(&[0x00; 6]).unwrap(),
        );
        let prepared =
            prepare_io(&pool, &mut exchange, &request, &target(), &IdentityMapper, 8).unwrap();
        assert_eq!(exchange.entries().len(), 2);
        assert!(exchange.entries()[1].last);
        assert!(!exchange.entries()[0].last);
        assert!(exchange.rsp().iter().all(|b| *b == 0));
        assert_eq!(prepared.work.kind, CommandKind::Control);
        assert_eq!(prepared.work.timeout_secs, 30);
    }

    #[test]
    fn too_many_segments_is_rejected() {
        let pool = pool();
        let exchange_ref = pool.acquire(PortId::new(1).unwrap()).unwrap();
        let slot = pool.slot_at(exchange_ref).unwrap();
        let mut exchange = slot.lock();
        let regions = (0..9).map(|i| MemoryRegion::new(0x1000 * i, 512)).collect();
        let err = prepare_io(&pool, &mut exchange, &read_request(regions), &target(), &IdentityMapper, 8)
            .unwrap_err();
        assert_eq!(err, PrepareError::TooManySegments { segments: 9, max: 8 });
    }

    #[test]
    fn mapping_failure_unwinds() {
        let pool = pool();
        let exchange_ref = pool.acquire(PortId::new(1).unwrap()).unwrap();
        let slot = pool.slot_at(exchange_ref).unwrap();
        let mut exchange = slot.lock();
        let mapper = FailingMapper {
            fail_at: 2,
            mapped: AtomicUsize::new(0),
            unmapped: AtomicUsize::new(0),
        };
        let regions = (1..=4).map(|i| MemoryRegion::new(0x1000 * i, 512)).collect();
        let err = prepare_io(&pool, &mut exchange, &read_request(regions), &target(), &mapper, 8)
            .unwrap_err();
        assert!(matches!(err, PrepareError::Mapping(_)));
        assert_eq!(mapper.unmapped.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn legacy_oversized_region_fails_encoding_and_unwinds() {
        let pool: ExchangePool<()> = ExchangePool::new(Box::new(LegacyBackend), 2, 4, Duration::ZERO);
        pool.provision(2, &NoRegistration).unwrap();
        let exchange_ref = pool.acquire(PortId::new(1).unwrap()).unwrap();
        let slot = pool.slot_at(exchange_ref).unwrap();
        let mut exchange = slot.lock();
        let mapper = FailingMapper {
            fail_at: usize::MAX,
            mapped: AtomicUsize::new(0),
            unmapped: AtomicUsize::new(0),
        };
        let request = read_request(vec![MemoryRegion::new(0x1000, 0x0100_0000)]);
        let err = prepare_io(&pool, &mut exchange, &request, &target(), &mapper, 4).unwrap_err();
        assert!(matches!(err, PrepareError::Encoding(_)));
        assert_eq!(mapper.unmapped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn task_mgmt_has_flag_and_no_data() {
        let pool = pool();
        let exchange_ref = pool.acquire(PortId::new(1).unwrap()).unwrap();
        let slot = pool.slot_at(exchange_ref).unwrap();
        let mut exchange = slot.lock();
        let work = prepare_task_mgmt(
            &pool,
            &mut exchange,
            &target(),
            3,
            TaskMgmtFlags::LUN_RESET,
            Duration::from_secs(60),
        )
        .unwrap();
        assert_eq!(work.cmnd.task_mgmt, TaskMgmtFlags::LUN_RESET);
        assert_eq!(work.cmnd.lun, 3);
        assert_eq!(work.timeout_secs, 60);
        assert_eq!(work.kind, CommandKind::Control);
        assert!(exchange.entries()[1].last);
    }

    #[test]
    fn long_timeouts_encode_as_zero() {
        assert_eq!(timeout_field(Duration::from_secs(255)), 255);
        assert_eq!(timeout_field(Duration::from_secs(256)), 0);
    }
}
