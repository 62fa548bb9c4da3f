use crate::pool::SlotState;
use crate::tags::ExchangeTag;
use fcio_proto::{
    BDE_LEN, FCP_CMND_LEN, FCP_RSP_LEN, PortId, ProtoError, SGE_LEN, SgEntry, bde_flags,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::Range;
use std::time::Instant;

/// Entries per registration block accepted by the modern adapter.
pub const SGL_POST_BLOCK: usize = 254;

/// Hardware generation served by a backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Generation {
    /// Descriptor-list adapters with driver-assigned iotags.
    Legacy,
    /// Adapters with tag-pinned scatter-gather lists.
    #[default]
    Modern,
}

impl Generation {
    pub fn as_str(self) -> &'static str {
        match self {
            Generation::Legacy => "legacy",
            Generation::Modern => "modern",
        }
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Placement of the command unit, response unit and descriptor table inside
/// one exchange area.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AreaLayout {
    pub cmnd: Range<usize>,
    pub rsp: Range<usize>,
    pub table: Range<usize>,
    pub entry_len: usize,
    pub total: usize,
}

impl AreaLayout {
    /// Descriptor slots available, including the fixed command/response pair.
    pub fn table_entries(&self) -> usize {
        self.table.len() / self.entry_len
    }
}

/// A scatter-gather table registration request for one exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SglPost {
    pub tag: ExchangeTag,
    pub table_addr: u64,
    pub table_len: usize,
}

/// Registration failure reported by the adapter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistrationError {
    message: String,
}

impl RegistrationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sgl registration failed: {}", self.message)
    }
}

impl std::error::Error for RegistrationError {}

/// Adapter-side sink for scatter-gather table registrations.
pub trait SglRegistrar {
    fn post_sgl_block(&self, block: &[SglPost]) -> Result<(), RegistrationError>;
}

/// A recently confirmed exchange that must not be reused for `target` yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReuseHold {
    pub target: PortId,
    pub until: Instant,
}

impl ReuseHold {
    pub fn blocks(&self, target: PortId, now: Instant) -> bool {
        self.target == target && now < self.until
    }
}

/// Slot index to active reuse hold.
pub type ReuseHolds = HashMap<usize, ReuseHold>;

/// Generation-specific behavior of the exchange pool, chosen once at
/// construction.
pub trait ExchangeBackend: Send + Sync + fmt::Debug {
    fn generation(&self) -> Generation;

    /// First tag handed out by this generation's allocator.
    fn tag_base(&self) -> u16;

    fn layout(&self, max_segments: usize) -> AreaLayout;

    /// Encode `entries` into `table`. `inbound` marks data flowing to the host.
    fn write_table(
        &self,
        table: &mut [u8],
        entries: &[SgEntry],
        inbound: bool,
    ) -> Result<(), ProtoError>;

    /// Registration block size, or `None` when the generation has nothing to
    /// register.
    fn registration_block(&self) -> Option<usize>;

    /// Position in `free` of the buffer to hand to `target`.
    fn pick_free(
        &self,
        free: &VecDeque<usize>,
        holds: &ReuseHolds,
        target: PortId,
        now: Instant,
    ) -> Option<usize>;

    /// State a buffer enters when released after completion.
    fn release_state(&self, exchange_busy: bool) -> SlotState;

    /// Whether confirming a quarantined exchange places a reuse hold.
    fn holds_reuse(&self) -> bool;
}

/// Descriptor-list backend: simple pop, exchange-busy is never reported.
#[derive(Clone, Copy, Debug, Default)]
pub struct LegacyBackend;

impl ExchangeBackend for LegacyBackend {
    fn generation(&self) -> Generation {
        Generation::Legacy
    }

    fn tag_base(&self) -> u16 {
        // iotag 0 means "no tag" to the adapter
        1
    }

    fn layout(&self, max_segments: usize) -> AreaLayout {
        let cmnd = 0..FCP_CMND_LEN;
        let rsp = cmnd.end..cmnd.end + FCP_RSP_LEN;
        let table = rsp.end..rsp.end + (max_segments + 2) * BDE_LEN;
        let total = table.end;
        AreaLayout {
            cmnd,
            rsp,
            table,
            entry_len: BDE_LEN,
            total,
        }
    }

    fn write_table(
        &self,
        table: &mut [u8],
        entries: &[SgEntry],
        inbound: bool,
    ) -> Result<(), ProtoError> {
        for (i, (entry, chunk)) in entries.iter().zip(table.chunks_exact_mut(BDE_LEN)).enumerate() {
            let flags = if i >= 2 && inbound {
                bde_flags::BDE_64I
            } else {
                bde_flags::BDE_64
            };
            chunk.copy_from_slice(&entry.encode_bde(flags)?);
        }
        Ok(())
    }

    fn registration_block(&self) -> Option<usize> {
        None
    }

    fn pick_free(
        &self,
        free: &VecDeque<usize>,
        _holds: &ReuseHolds,
        _target: PortId,
        _now: Instant,
    ) -> Option<usize> {
        (!free.is_empty()).then_some(0)
    }

    fn release_state(&self, _exchange_busy: bool) -> SlotState {
        SlotState::Free
    }

    fn holds_reuse(&self) -> bool {
        false
    }
}

/// Tag-pinned scatter-gather backend.
///
/// The table sits at the start of the area with the command and response
/// units packed at its end. Released exchanges that the adapter still reports
/// busy stay quarantined until confirmed, and confirmed exchanges are held
/// back from the target that aborted them for a while.
#[derive(Clone, Copy, Debug)]
pub struct ModernBackend {
    xri_base: u16,
}

impl ModernBackend {
    pub fn new(xri_base: u16) -> Self {
        Self { xri_base }
    }
}

impl ExchangeBackend for ModernBackend {
    fn generation(&self) -> Generation {
        Generation::Modern
    }

    fn tag_base(&self) -> u16 {
        self.xri_base
    }

    fn layout(&self, max_segments: usize) -> AreaLayout {
        let table = 0..(max_segments + 2) * SGE_LEN;
        let cmnd = table.end..table.end + FCP_CMND_LEN;
        let rsp = cmnd.end..cmnd.end + FCP_RSP_LEN;
        let total = rsp.end;
        AreaLayout {
            cmnd,
            rsp,
            table,
            entry_len: SGE_LEN,
            total,
        }
    }

    fn write_table(
        &self,
        table: &mut [u8],
        entries: &[SgEntry],
        _inbound: bool,
    ) -> Result<(), ProtoError> {
        for (entry, chunk) in entries.iter().zip(table.chunks_exact_mut(SGE_LEN)) {
            chunk.copy_from_slice(&entry.encode_sge()?);
        }
        Ok(())
    }

    fn registration_block(&self) -> Option<usize> {
        Some(SGL_POST_BLOCK)
    }

    fn pick_free(
        &self,
        free: &VecDeque<usize>,
        holds: &ReuseHolds,
        target: PortId,
        now: Instant,
    ) -> Option<usize> {
        free.iter().position(|index| {
            holds
                .get(index)
                .map_or(true, |hold| !hold.blocks(target, now))
        })
    }

    fn release_state(&self, exchange_busy: bool) -> SlotState {
        if exchange_busy {
            SlotState::Busy
        } else {
            SlotState::Free
        }
    }

    fn holds_reuse(&self) -> bool {
        true
    }
}

/// Backend for `generation`.
pub fn backend_for(generation: Generation, xri_base: u16) -> Box<dyn ExchangeBackend> {
    match generation {
        Generation::Legacy => Box::new(LegacyBackend),
        Generation::Modern => Box::new(ModernBackend::new(xri_base)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn port(raw: u32) -> PortId {
        PortId::new(raw).unwrap()
    }

    #[test]
    fn legacy_layout_puts_table_after_units() {
        let layout = LegacyBackend.layout(4);
        assert_eq!(layout.cmnd, 0..FCP_CMND_LEN);
        assert_eq!(layout.table.start, FCP_CMND_LEN + FCP_RSP_LEN);
        assert_eq!(layout.table_entries(), 6);
    }

    #[test]
    fn modern_layout_packs_units_at_end() {
        let layout = ModernBackend::new(0x80).layout(4);
        assert_eq!(layout.table, 0..6 * SGE_LEN);
        assert_eq!(layout.rsp.end, layout.total);
        assert_eq!(layout.cmnd.end, layout.rsp.start);
    }

    #[test]
    fn legacy_marks_inbound_data_descriptors() {
        let mut table = [0u8; 3 * BDE_LEN];
        let entries = [
            SgEntry::new(0x1000, 32),
            SgEntry::new(0x1020, 160),
            SgEntry::new(0x9000, 4096),
        ];
        LegacyBackend.write_table(&mut table, &entries, true).unwrap();
        let (_, cmd_flags) = SgEntry::decode_bde(&table[0..BDE_LEN]).unwrap();
        let (data, data_flags) = SgEntry::decode_bde(&table[2 * BDE_LEN..]).unwrap();
        assert_eq!(cmd_flags, bde_flags::BDE_64);
        assert_eq!(data_flags, bde_flags::BDE_64I);
        assert_eq!(data.addr, 0x9000);
    }

    #[test]
    fn modern_pick_skips_held_exchange_for_same_target() {
        let backend = ModernBackend::new(0);
        let now = Instant::now();
        let free: VecDeque<usize> = [3, 4, 5].into_iter().collect();
        let mut holds = ReuseHolds::new();
        holds.insert(
            3,
            ReuseHold {
                target: port(0x10200),
                until: now + Duration::from_secs(5),
            },
        );
        assert_eq!(backend.pick_free(&free, &holds, port(0x10200), now), Some(1));
        assert_eq!(backend.pick_free(&free, &holds, port(0x10300), now), Some(0));
        let later = now + Duration::from_secs(6);
        assert_eq!(backend.pick_free(&free, &holds, port(0x10200), later), Some(0));
    }

    #[test]
    fn release_state_follows_generation() {
        assert_eq!(LegacyBackend.release_state(true), SlotState::Free);
        assert_eq!(ModernBackend::new(0).release_state(true), SlotState::Busy);
        assert_eq!(ModernBackend::new(0).release_state(false), SlotState::Free);
    }
}
