use anyhow::{Result, ensure};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Hardware exchange identifier (iotag on legacy adapters, XRI on modern ones).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExchangeTag(pub u16);

impl fmt::Display for ExchangeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Hands out exchange tags from a contiguous window starting at `base`.
///
/// Retired tags are handed out again before the window advances.
#[derive(Debug)]
pub struct TagAllocator {
    base: u16,
    count: u16,
    inner: Mutex<TagSpace>,
}

#[derive(Debug)]
struct TagSpace {
    next: u16,
    retired: Vec<u16>,
    issued: Vec<bool>,
}

impl TagAllocator {
    pub fn new(base: u16, count: u16) -> Self {
        let count = count.min(u16::MAX - base);
        Self {
            base,
            count,
            inner: Mutex::new(TagSpace {
                next: 0,
                retired: Vec::new(),
                issued: vec![false; count as usize],
            }),
        }
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    pub fn capacity(&self) -> usize {
        self.count as usize
    }

    /// Allocate a tag, or `None` when the window is exhausted.
    pub fn allocate_tag(&self) -> Option<ExchangeTag> {
        let mut space = self.lock();
        let offset = match space.retired.pop() {
            Some(offset) => offset,
            None if space.next < self.count => {
                let offset = space.next;
                space.next += 1;
                offset
            }
            None => return None,
        };
        space.issued[offset as usize] = true;
        Some(ExchangeTag(self.base + offset))
    }

    pub fn retire_tag(&self, tag: ExchangeTag) -> Result<()> {
        let offset = self
            .index_of(tag)
            .ok_or_else(|| anyhow::anyhow!("tag {tag} outside allocator window"))?;
        let mut space = self.lock();
        ensure!(space.issued[offset], "tag {tag} retired twice");
        space.issued[offset] = false;
        space.retired.push(offset as u16);
        Ok(())
    }

    pub fn index_of(&self, tag: ExchangeTag) -> Option<usize> {
        let offset = tag.0.checked_sub(self.base)?;
        (offset < self.count).then_some(offset as usize)
    }

    pub fn tag_at(&self, index: usize) -> Option<ExchangeTag> {
        (index < self.count as usize).then(|| ExchangeTag(self.base + index as u16))
    }

    pub fn outstanding(&self) -> usize {
        self.lock().issued.iter().filter(|issued| **issued).count()
    }

    fn lock(&self) -> MutexGuard<'_, TagSpace> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
