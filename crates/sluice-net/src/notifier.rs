use std::{io, os::fd::RawFd};

use mio::{Interest, Registry, Token, unix::SourceFd};

use crate::conn::Conn;

bitflags::bitflags! {
    /// Readiness interests programmed for a connection.
    ///
    /// On the epoll backend, read interest implies peer-half-close
    /// notification (`EPOLLRDHUP`); it surfaces as `Event::is_read_closed`
    /// rather than as a separate flag here.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct EventFlags: u8 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
    }
}

/// How `Modify` combines the requested flags with what is already
/// programmed. `Add` always replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Combine {
    Or,
    AndNot,
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    Add,
    Modify(Combine),
    Del,
}

fn compose(current: EventFlags, action: Action, flags: EventFlags) -> EventFlags {
    match action {
        Action::Add | Action::Modify(Combine::Replace) => flags,
        Action::Modify(Combine::Or) => current | flags,
        Action::Modify(Combine::AndNot) => current - flags,
        Action::Del => EventFlags::empty(),
    }
}

fn interest(flags: EventFlags) -> io::Result<Interest> {
    let mut interest = None;
    if flags.contains(EventFlags::READABLE) {
        interest = Some(Interest::READABLE);
    }
    if flags.contains(EventFlags::WRITABLE) {
        interest = Some(interest.map_or(Interest::WRITABLE, |i| i | Interest::WRITABLE));
    }
    interest.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty interest set"))
}

/// Shareable handle to the kernel readiness facility.
///
/// `update` is the single mutation point for notifier state: it composes
/// the new flag set from the connection's shadow copy, programs the kernel
/// and writes the shadow back, so the two can never drift. Safe to call
/// from any thread; the caller holds the connection's slot lock.
pub(crate) struct Notifier {
    registry: Registry,
}

impl Notifier {
    pub(crate) fn new(registry: Registry) -> Self {
        Self { registry }
    }

    pub(crate) fn update(
        &self,
        fd: RawFd,
        token: Token,
        action: Action,
        flags: EventFlags,
        conn: &mut Conn,
    ) -> io::Result<()> {
        let next = compose(conn.flags, action, flags);
        match action {
            Action::Add => self.registry.register(&mut SourceFd(&fd), token, interest(next)?),
            Action::Modify(_) => {
                self.registry.reregister(&mut SourceFd(&fd), token, interest(next)?)
            }
            Action::Del => self.registry.deregister(&mut SourceFd(&fd)),
        }?;
        conn.flags = next;
        Ok(())
    }
}
