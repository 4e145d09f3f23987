use super::link::{LinkRole, PhysicalLink};
use backoff::{backoff::Backoff, ExponentialBackoff};
use plcwire_sdk::{build_exponential_backoff, RetryPolicy};
use tokio::time::Instant;

/// Lock-free view of the logical channel published after every mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub connected: bool,
    pub active_role: LinkRole,
    /// Generation of the active link; inbound frames from any other are discarded
    pub active_generation: u64,
}

/// Pacing for (re)opening one role.
#[derive(Debug)]
pub(super) struct OpenPacing {
    backoff: ExponentialBackoff,
    policy: RetryPolicy,
    pub failures: u32,
    pub next_attempt: Instant,
}

impl OpenPacing {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            backoff: build_exponential_backoff(&policy),
            policy,
            failures: 0,
            next_attempt: Instant::now(),
        }
    }

    /// Whether the role may be attempted at `now`.
    pub fn due(&self, now: Instant) -> bool {
        self.policy.allows_attempt(self.failures) && now >= self.next_attempt
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.failures = self.failures.saturating_add(1);
        match self.backoff.next_backoff() {
            Some(delay) => self.next_attempt = now + delay,
            None => self.failures = u32::MAX,
        }
    }

    pub fn reset(&mut self) {
        self.backoff.reset();
        self.failures = 0;
        self.next_attempt = Instant::now();
    }
}

/// A link to open outside the lock, with its generation already reserved.
#[derive(Debug)]
pub(super) struct OpenPlan {
    pub role: LinkRole,
    pub address: String,
    pub generation: u64,
}

/// What currently occupies a role, as seen by the supervisor.
pub(super) enum Slot<'a> {
    Missing(&'a OpenPacing),
    Present(&'a PhysicalLink),
}

/// Everything the multiplexer mutates under its lock.
#[derive(Debug)]
pub(super) struct LogicalChannelState {
    pub connected: bool,
    pub active_role: LinkRole,
    pub primary: Option<PhysicalLink>,
    pub secondary: Option<PhysicalLink>,
    pub primary_address: String,
    pub secondary_address: Option<String>,
    pub primary_pacing: OpenPacing,
    pub secondary_pacing: OpenPacing,
    pub next_generation: u64,
    pub last_full_retry: Instant,
    pub closed: bool,
}

impl LogicalChannelState {
    pub fn new(primary: String, secondary: Option<String>, policy: RetryPolicy) -> Self {
        Self {
            connected: false,
            active_role: LinkRole::Primary,
            primary: None,
            secondary: None,
            primary_address: primary,
            secondary_address: secondary,
            primary_pacing: OpenPacing::new(policy),
            secondary_pacing: OpenPacing::new(policy),
            next_generation: 1,
            last_full_retry: Instant::now(),
            closed: false,
        }
    }

    pub fn roles(&self) -> &'static [LinkRole] {
        if self.secondary_address.is_some() {
            &[LinkRole::Primary, LinkRole::Secondary]
        } else {
            &[LinkRole::Primary]
        }
    }

    pub fn address(&self, role: LinkRole) -> Option<&str> {
        match role {
            LinkRole::Primary => Some(&self.primary_address),
            LinkRole::Secondary => self.secondary_address.as_deref(),
        }
    }

    pub fn link(&self, role: LinkRole) -> Option<&PhysicalLink> {
        match role {
            LinkRole::Primary => self.primary.as_ref(),
            LinkRole::Secondary => self.secondary.as_ref(),
        }
    }

    pub fn slot(&mut self, role: LinkRole) -> &mut Option<PhysicalLink> {
        match role {
            LinkRole::Primary => &mut self.primary,
            LinkRole::Secondary => &mut self.secondary,
        }
    }

    pub fn pacing(&mut self, role: LinkRole) -> &mut OpenPacing {
        match role {
            LinkRole::Primary => &mut self.primary_pacing,
            LinkRole::Secondary => &mut self.secondary_pacing,
        }
    }

    #[inline]
    pub fn is_alive(&self, role: LinkRole) -> bool {
        self.link(role).is_some_and(PhysicalLink::is_alive)
    }

    pub fn active(&self) -> Option<&PhysicalLink> {
        self.link(self.active_role)
    }

    /// Generation for the next link; never reused within one channel.
    pub fn allocate_generation(&mut self) -> u64 {
        let g = self.next_generation;
        self.next_generation += 1;
        g
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            connected: self.connected,
            active_role: self.active_role,
            active_generation: self.active().map_or(0, |l| l.generation),
        }
    }

    /// Reserve generations for every role `wanted` selects.
    pub fn open_plan(&mut self, mut wanted: impl FnMut(Slot<'_>) -> bool) -> Vec<OpenPlan> {
        let mut plan = Vec::new();
        for role in self.roles() {
            let slot = match self.link(*role) {
                Some(link) => Slot::Present(link),
                None => Slot::Missing(match role {
                    LinkRole::Primary => &self.primary_pacing,
                    LinkRole::Secondary => &self.secondary_pacing,
                }),
            };
            if !wanted(slot) {
                continue;
            }
            let Some(address) = self.address(*role).map(str::to_string) else {
                continue;
            };
            plan.push(OpenPlan {
                role: *role,
                address,
                generation: self.allocate_generation(),
            });
        }
        plan
    }
}
