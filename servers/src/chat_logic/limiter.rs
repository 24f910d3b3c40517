use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

// Above this many tracked addresses, idle ones are dropped on the next check.
const PRUNE_THRESHOLD: usize = 4096;

const SECOND: Duration = Duration::from_secs(1);
const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// At most `limit` hits per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule {
    pub limit: usize,
    pub window: Duration,
}

impl Rule {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self { limit: limit as usize, window }
    }

    pub fn per_second(limit: u32) -> Self {
        Self::new(limit, SECOND)
    }

    pub fn per_hour(limit: u32) -> Self {
        Self::new(limit, HOUR)
    }

    pub fn per_day(limit: u32) -> Self {
        Self::new(limit, DAY)
    }
}

/// Sliding-window limiter keyed by remote address.
///
/// Every rule must pass for a hit to be admitted, and only admitted hits are
/// recorded. Rules with a limit of 0 are dropped, so a limiter without rules
/// lets everything through.
pub struct RateLimiter {
    rules: Vec<Rule>,
    // Longest window; older timestamps no longer matter to any rule.
    horizon: Duration,
    hits: Mutex<HashMap<IpAddr, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(rules: impl IntoIterator<Item = Rule>) -> Self {
        let rules: Vec<Rule> = rules.into_iter().filter(|rule| rule.limit > 0).collect();
        let horizon = rules.iter().map(|rule| rule.window).max().unwrap_or_default();
        Self {
            rules,
            horizon,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Records a hit for `ip` and reports whether it is within every rule.
    pub fn check(&self, ip: IpAddr) -> bool {
        self.check_at(ip, Instant::now())
    }

    pub fn check_at(&self, ip: IpAddr, now: Instant) -> bool {
        if self.rules.is_empty() {
            return true;
        }
        let mut hits = self.hits.lock().unwrap_or_else(PoisonError::into_inner);

        if hits.len() > PRUNE_THRESHOLD {
            let horizon = self.horizon;
            hits.retain(|_, stamps| stamps.back().is_some_and(|last| now.duration_since(*last) < horizon));
        }

        let stamps = hits.entry(ip).or_default();
        while let Some(oldest) = stamps.front() {
            if now.duration_since(*oldest) >= self.horizon {
                stamps.pop_front();
            } else {
                break;
            }
        }

        for rule in &self.rules {
            let expired = stamps.partition_point(|stamp| now.duration_since(*stamp) >= rule.window);
            if stamps.len() - expired >= rule.limit {
                return false;
            }
        }
        stamps.push_back(now);
        true
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.hits.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// One limiter per rate-limited route, each with its own counters.
pub struct RouteLimits {
    pub index: RateLimiter,
    pub submit: RateLimiter,
    pub receive: RateLimiter,
}

impl RouteLimits {
    /// `per_day` and `per_hour` apply to every route; `/receive` is
    /// additionally held to `receive_per_second`. Zero disables a rule.
    pub fn new(per_day: u32, per_hour: u32, receive_per_second: u32) -> Self {
        let defaults = [Rule::per_day(per_day), Rule::per_hour(per_hour)];
        Self {
            index: RateLimiter::new(defaults),
            submit: RateLimiter::new(defaults),
            receive: RateLimiter::new(defaults.into_iter().chain([Rule::per_second(receive_per_second)])),
        }
    }

    #[cfg(test)]
    pub fn unlimited() -> Self {
        Self::new(0, 0, 0)
    }
}
