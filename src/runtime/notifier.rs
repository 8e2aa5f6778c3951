//! Readiness notifier over mio.
//!
//! Keeps a table of registrations, each an interest mask plus an optional
//! per-socket context, and turns raw mio events into an owned batch of
//! [`ReadyEvent`]s. The caller owns the sockets; a registration is keyed by
//! its [`Token`].

use mio::event::{Event, Source};
use mio::{Events, Poll, Token, Waker};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::ops::BitOr;
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

/// Interest mask for a registration.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Interests(u8);

impl Interests {
    /// A connection is waiting in the listener's backlog.
    pub const ACCEPTABLE: Interests = Interests(0b01);
    /// Bytes (or EOF) are available on a stream.
    pub const READABLE: Interests = Interests(0b10);

    pub const fn empty() -> Self {
        Interests(0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn is_acceptable(self) -> bool {
        self.0 & Self::ACCEPTABLE.0 != 0
    }

    pub const fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    /// Both kinds map onto mio's read readiness.
    fn to_mio(self) -> Option<mio::Interest> {
        if self.is_empty() {
            None
        } else {
            Some(mio::Interest::READABLE)
        }
    }

    /// The subset of this mask satisfied by a raw mio event.
    fn satisfied_by(self, event: &Event) -> Interests {
        let mut fired = Interests::empty();
        if self.is_acceptable() && (event.is_readable() || event.is_error()) {
            fired = fired | Interests::ACCEPTABLE;
        }
        if self.is_readable() && (event.is_readable() || event.is_read_closed() || event.is_error())
        {
            fired = fired | Interests::READABLE;
        }
        fired
    }
}

impl BitOr for Interests {
    type Output = Interests;

    fn bitor(self, rhs: Interests) -> Interests {
        Interests(self.0 | rhs.0)
    }
}

impl fmt::Debug for Interests {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_acceptable(), self.is_readable()) {
            (true, true) => f.write_str("ACCEPTABLE | READABLE"),
            (true, false) => f.write_str("ACCEPTABLE"),
            (false, true) => f.write_str("READABLE"),
            (false, false) => f.write_str("(empty)"),
        }
    }
}

/// How long [`Notifier::wait`] may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Return at once with whatever is ready.
    Immediate,
    /// Block for at most this long.
    After(Duration),
    /// Block until something is ready.
    Forever,
}

impl Timeout {
    /// `0` is immediate, negative values block forever.
    pub fn from_millis(millis: i64) -> Self {
        match millis {
            0 => Timeout::Immediate,
            m if m < 0 => Timeout::Forever,
            m => Timeout::After(Duration::from_millis(m as u64)),
        }
    }

    fn as_duration(self) -> Option<Duration> {
        match self {
            Timeout::Immediate => Some(Duration::ZERO),
            Timeout::After(d) => Some(d),
            Timeout::Forever => None,
        }
    }
}

/// One ready socket in a wait batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    pub token: Token,
    pub ready: Interests,
}

impl ReadyEvent {
    pub fn readable(token: Token) -> Self {
        Self {
            token,
            ready: Interests::READABLE,
        }
    }

    pub fn is_acceptable(&self) -> bool {
        self.ready.is_acceptable()
    }

    pub fn is_readable(&self) -> bool {
        self.ready.is_readable()
    }
}

/// Registration failures. The socket should be dropped by the caller.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("cannot register token {}: {source}", .token.0)]
    Io {
        token: Token,
        #[source]
        source: io::Error,
    },
    #[error("empty interest for token {}", .token.0)]
    EmptyInterest { token: Token },
    #[error("readable interest for token {} has no buffer", .token.0)]
    MissingContext { token: Token },
}

/// Failures of the readiness primitive itself. Always fatal.
#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("failed to create poll instance: {0}")]
    Create(#[source] io::Error),
    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),
    #[error("failed to create waker: {0}")]
    Waker(#[source] io::Error),
}

struct Registration<C> {
    interest: Interests,
    context: Option<C>,
}

/// Readiness notifier with per-registration context of type `C`.
pub struct Notifier<C> {
    poll: Poll,
    events: Events,
    registrations: HashMap<Token, Registration<C>>,
}

impl<C> Notifier<C> {
    /// Create a notifier returning at most `events_capacity` events per wait.
    pub fn new(events_capacity: usize) -> Result<Self, NotifierError> {
        Ok(Self {
            poll: Poll::new().map_err(NotifierError::Create)?,
            events: Events::with_capacity(events_capacity),
            registrations: HashMap::new(),
        })
    }

    /// Add or update the registration for `token`.
    ///
    /// Re-registering overwrites the interest and context; the replaced
    /// context is returned.
    pub fn register<S>(
        &mut self,
        source: &mut S,
        token: Token,
        interest: Interests,
        context: Option<C>,
    ) -> Result<Option<C>, RegistrationError>
    where
        S: Source + ?Sized,
    {
        let mio_interest = interest
            .to_mio()
            .ok_or(RegistrationError::EmptyInterest { token })?;
        if interest.is_readable() && context.is_none() {
            return Err(RegistrationError::MissingContext { token });
        }

        match self.registrations.get_mut(&token) {
            Some(existing) => {
                self.poll
                    .registry()
                    .reregister(source, token, mio_interest)
                    .map_err(|source| RegistrationError::Io { token, source })?;
                existing.interest = interest;
                Ok(std::mem::replace(&mut existing.context, context))
            }
            None => {
                self.poll
                    .registry()
                    .register(source, token, mio_interest)
                    .map_err(|source| RegistrationError::Io { token, source })?;
                self.registrations
                    .insert(token, Registration { interest, context });
                Ok(None)
            }
        }
    }

    /// Remove the registration for `token`, returning its context.
    ///
    /// Unknown tokens are a no-op.
    pub fn deregister<S>(&mut self, source: &mut S, token: Token) -> Option<C>
    where
        S: Source + ?Sized,
    {
        let registration = self.registrations.remove(&token)?;
        if let Err(e) = self.poll.registry().deregister(source) {
            trace!(token = token.0, error = %e, "Deregister failed");
        }
        registration.context
    }

    /// Block until a registered socket is ready or `timeout` elapses.
    ///
    /// The returned batch is owned, lists each token once, and skips events
    /// for tokens without a registration. A signal interrupting the wait
    /// yields an empty batch.
    pub fn wait(&mut self, timeout: Timeout) -> Result<Vec<ReadyEvent>, NotifierError> {
        match self.poll.poll(&mut self.events, timeout.as_duration()) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(NotifierError::Poll(e)),
        }

        let mut batch: Vec<ReadyEvent> = Vec::new();
        for event in self.events.iter() {
            let token = event.token();
            let Some(registration) = self.registrations.get(&token) else {
                continue;
            };
            let fired = registration.interest.satisfied_by(event);
            if fired.is_empty() {
                continue;
            }
            match batch.iter_mut().find(|ready| ready.token == token) {
                Some(ready) => ready.ready = ready.ready | fired,
                None => batch.push(ReadyEvent {
                    token,
                    ready: fired,
                }),
            }
        }
        Ok(batch)
    }

    /// Create a waker that interrupts [`Notifier::wait`] from another thread.
    ///
    /// Its events carry `token` and never show up in a batch.
    pub fn waker(&self, token: Token) -> Result<Waker, NotifierError> {
        Waker::new(self.poll.registry(), token).map_err(NotifierError::Waker)
    }

    #[cfg(test)]
    pub fn context(&self, token: Token) -> Option<&C> {
        self.registrations.get(&token)?.context.as_ref()
    }

    pub fn context_mut(&mut self, token: Token) -> Option<&mut C> {
        self.registrations.get_mut(&token)?.context.as_mut()
    }

    #[cfg(test)]
    pub fn interest(&self, token: Token) -> Option<Interests> {
        self.registrations.get(&token).map(|r| r.interest)
    }

    pub fn is_registered(&self, token: Token) -> bool {
        self.registrations.contains_key(&token)
    }

    /// Number of active registrations.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}
