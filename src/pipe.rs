//! Pipe topology for a single child.
//!
//! A [`PipeSet`] holds every descriptor end a launch needs, one named
//! [`Slot`] per [`Role`]. All ends are created close-on-exec, so the only
//! descriptors that survive into the target program are the ones the child
//! explicitly duplicates onto stdin/stdout.
//!
//! After `fork` the parent closes the child-owned ends right away. That keeps
//! them from leaking into later launches, and it lets a read on the output
//! pipe observe end-of-file once the child really exits.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::fcntl::OFlag;
use nix::unistd::pipe2;

use crate::error::{Error, Result};

/// Which end of which pipe a slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Parent reads the child's stdout here.
    ParentRead,
    /// Parent writes the child's stdin here.
    ParentWrite,
    /// Becomes the child's stdin.
    ChildRead,
    /// Becomes the child's stdout.
    ChildWrite,
    /// Parent reads exec-failure reports here.
    ErrorRead,
    /// Child reports its exec failure here.
    ErrorWrite,
}

impl Role {
    pub const ALL: [Role; 6] = [
        Role::ParentRead,
        Role::ParentWrite,
        Role::ChildRead,
        Role::ChildWrite,
        Role::ErrorRead,
        Role::ErrorWrite,
    ];

    /// True for the ends the child keeps after fork.
    pub fn is_child_end(self) -> bool {
        matches!(self, Role::ChildRead | Role::ChildWrite | Role::ErrorWrite)
    }
}

/// One descriptor end, closed at most once.
#[derive(Debug, Default)]
pub struct Slot(Option<OwnedFd>);

impl Slot {
    pub fn new(fd: OwnedFd) -> Self {
        Slot(Some(fd))
    }

    pub fn raw(&self) -> Option<RawFd> {
        self.0.as_ref().map(|fd| fd.as_raw_fd())
    }

    pub fn is_open(&self) -> bool {
        self.0.is_some()
    }

    /// Close the descriptor. Closing an already closed slot does nothing.
    pub fn close(&mut self) {
        self.0.take();
    }

    /// Hand ownership of the descriptor to the caller, leaving the slot closed.
    pub fn take(&mut self) -> Option<OwnedFd> {
        self.0.take()
    }
}

/// Every descriptor end owned by one launch.
#[derive(Debug, Default)]
pub struct PipeSet {
    pub parent_read: Slot,
    pub parent_write: Slot,
    pub child_read: Slot,
    pub child_write: Slot,
    pub error_read: Slot,
    pub error_write: Slot,
}

fn cloexec_pipe() -> Result<(OwnedFd, OwnedFd)> {
    pipe2(OFlag::O_CLOEXEC).map_err(|source| Error::ResourceAllocation {
        what: "create pipe",
        source,
    })
}

impl PipeSet {
    /// Create the output pipe, the input pipe (unless `stdin` supplies the
    /// child's input end) and optionally the error-report pipe.
    ///
    /// On failure every end created so far is closed before the error is
    /// returned.
    pub fn allocate(with_error_channel: bool, stdin: Option<OwnedFd>) -> Result<Self> {
        let mut set = PipeSet::default();

        let (read, write) = cloexec_pipe()?;
        set.parent_read = Slot::new(read);
        set.child_write = Slot::new(write);

        match stdin {
            Some(fd) => set.child_read = Slot::new(fd),
            None => {
                let (read, write) = cloexec_pipe()?;
                set.child_read = Slot::new(read);
                set.parent_write = Slot::new(write);
            }
        }

        if with_error_channel {
            let (read, write) = cloexec_pipe()?;
            set.error_read = Slot::new(read);
            set.error_write = Slot::new(write);
        }

        Ok(set)
    }

    pub fn slot(&self, role: Role) -> &Slot {
        match role {
            Role::ParentRead => &self.parent_read,
            Role::ParentWrite => &self.parent_write,
            Role::ChildRead => &self.child_read,
            Role::ChildWrite => &self.child_write,
            Role::ErrorRead => &self.error_read,
            Role::ErrorWrite => &self.error_write,
        }
    }

    pub fn slot_mut(&mut self, role: Role) -> &mut Slot {
        match role {
            Role::ParentRead => &mut self.parent_read,
            Role::ParentWrite => &mut self.parent_write,
            Role::ChildRead => &mut self.child_read,
            Role::ChildWrite => &mut self.child_write,
            Role::ErrorRead => &mut self.error_read,
            Role::ErrorWrite => &mut self.error_write,
        }
    }

    /// Raw descriptor for a role, if that end is open.
    pub fn raw(&self, role: Role) -> Option<RawFd> {
        self.slot(role).raw()
    }

    /// Parent side after fork: drop every end that now belongs to the child.
    pub fn close_child_ends(&mut self) {
        for role in Role::ALL {
            if role.is_child_end() {
                self.slot_mut(role).close();
            }
        }
    }

    pub fn close_all(&mut self) {
        for role in Role::ALL {
            self.slot_mut(role).close();
        }
    }

    /// Snapshot of the raw descriptors, for use in the forked child where
    /// nothing may be dropped or allocated.
    pub(crate) fn raw_table(&self) -> RawTable {
        RawTable {
            parent_read: self.raw(Role::ParentRead).unwrap_or(-1),
            parent_write: self.raw(Role::ParentWrite).unwrap_or(-1),
            child_read: self.raw(Role::ChildRead).unwrap_or(-1),
            child_write: self.raw(Role::ChildWrite).unwrap_or(-1),
            error_read: self.raw(Role::ErrorRead).unwrap_or(-1),
            error_write: self.raw(Role::ErrorWrite).unwrap_or(-1),
        }
    }
}

/// Plain copy of a [`PipeSet`], `-1` marking a closed end.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawTable {
    pub parent_read: RawFd,
    pub parent_write: RawFd,
    pub child_read: RawFd,
    pub child_write: RawFd,
    pub error_read: RawFd,
    pub error_write: RawFd,
}
