use strata_io::{ChanId, IoBuffer, Reactor, VioId};

/// Role a channel plays within one state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VcRole {
    #[default]
    Unknown,
    Client,
    Origin,
    Transform,
    CacheRead,
    CacheWrite,
}

/// One slot of the table. `H` names the state-machine handler invoked for
/// events on the slot's VIOs.
#[derive(Debug)]
pub struct VcEntry<H: Copy> {
    pub chan: Option<ChanId>,
    pub read_buf: Option<IoBuffer>,
    pub write_buf: Option<IoBuffer>,
    pub read_vio: Option<VioId>,
    pub write_vio: Option<VioId>,
    pub read_handler: Option<H>,
    pub write_handler: Option<H>,
    pub role: VcRole,
    pub eos: bool,
    /// Channel ownership has been handed to the body tunnel; cleanup must
    /// not close it.
    pub in_tunnel: bool,
}

impl<H: Copy> Default for VcEntry<H> {
    fn default() -> Self {
        Self {
            chan: None,
            read_buf: None,
            write_buf: None,
            read_vio: None,
            write_vio: None,
            read_handler: None,
            write_handler: None,
            role: VcRole::Unknown,
            eos: false,
            in_tunnel: false,
        }
    }
}

impl<H: Copy> VcEntry<H> {
    fn clear(&mut self) {
        *self = Self::default();
    }
}

pub const VC_TABLE_MAX_ENTRIES: usize = 4;

/// Fixed-capacity registry of the channels a state machine owns: client,
/// origin, cache-read, and transform-or-cache-write. The bound is part of
/// the correctness argument; allocation past it is a hard fault.
pub struct VcTable<H: Copy> {
    entries: [VcEntry<H>; VC_TABLE_MAX_ENTRIES],
}

impl<H: Copy> Default for VcTable<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Copy> VcTable<H> {
    pub fn new() -> Self {
        Self { entries: Default::default() }
    }

    /// Linear scan for a free slot. Panics when all four are in use.
    pub fn new_entry(&mut self) -> &mut VcEntry<H> {
        for entry in &mut self.entries {
            if entry.chan.is_none() {
                return entry;
            }
        }
        panic!("vc table overflow: all {VC_TABLE_MAX_ENTRIES} slots in use");
    }

    pub fn find_entry(&mut self, chan: ChanId) -> Option<&mut VcEntry<H>> {
        self.entries.iter_mut().find(|e| e.chan == Some(chan))
    }

    pub fn find_entry_by_vio(&mut self, vio: VioId) -> Option<&mut VcEntry<H>> {
        self.entries
            .iter_mut()
            .find(|e| e.read_vio == Some(vio) || e.write_vio == Some(vio))
    }

    pub fn find_role(&mut self, role: VcRole) -> Option<&mut VcEntry<H>> {
        self.entries.iter_mut().find(|e| e.chan.is_some() && e.role == role)
    }

    /// Drop the entry without touching the channel (ownership moved
    /// elsewhere, e.g. a pooled origin session).
    pub fn remove_entry(&mut self, chan: ChanId) {
        if let Some(entry) = self.find_entry(chan) {
            entry.clear();
        }
    }

    /// Close the entry's channel (unless the tunnel owns it) and free the
    /// slot.
    pub fn cleanup_entry(&mut self, rx: &mut Reactor, chan: ChanId) {
        if let Some(entry) = self.find_entry(chan) {
            if !entry.in_tunnel
                && let Some(chan) = entry.chan
            {
                rx.do_io_close(chan);
            }
            entry.clear();
        }
    }

    pub fn cleanup_all(&mut self, rx: &mut Reactor) {
        for i in 0..VC_TABLE_MAX_ENTRIES {
            if let Some(chan) = self.entries[i].chan {
                if !self.entries[i].in_tunnel {
                    rx.do_io_close(chan);
                }
                self.entries[i].clear();
            }
        }
    }

    /// Safety gate checked before the state machine destroys itself.
    pub fn is_table_clear(&self) -> bool {
        self.entries.iter().all(|e| e.chan.is_none())
    }
}
