use crate::tilebuf::types::{Addr, RequesterId, Word};
use crate::timeq::Cycle;

/// The slower memory tier behind the tile buffer. Accesses are word sized and may take several
/// cycles: `None` / `false` means "not ready yet", and the requester re-presents the same access
/// on a later cycle.
pub trait ExternalMemory {
    fn read(&mut self, now: Cycle, requester: RequesterId, addr: Addr) -> Option<Word>;

    fn write(&mut self, now: Cycle, requester: RequesterId, addr: Addr, data: Word) -> bool;
}
