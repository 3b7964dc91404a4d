//! Rate limits for calling the structured query service.
//!
//! Written as `N/s` or `N/m` on the command line.

use std::{fmt, str::FromStr, time::Duration};

use leaky_bucket::RateLimiter;

use crate::prelude::*;

/// The period over which the rate limit is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitPeriod {
    /// Per second.
    Second,
    /// Per minute.
    Minute,
}

impl RateLimitPeriod {
    /// Convert this period to a number of seconds.
    pub fn to_duration(self) -> Duration {
        match self {
            RateLimitPeriod::Second => Duration::from_secs(1),
            RateLimitPeriod::Minute => Duration::from_secs(60),
        }
    }
}

impl fmt::Display for RateLimitPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitPeriod::Second => write!(f, "s"),
            RateLimitPeriod::Minute => write!(f, "m"),
        }
    }
}

impl FromStr for RateLimitPeriod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "s" => Ok(RateLimitPeriod::Second),
            "m" => Ok(RateLimitPeriod::Minute),
            _ => Err(anyhow!("Unsupported rate limit period: {:?}", s)),
        }
    }
}

/// A rate limit for an API.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimit {
    /// The maximum number of requests allowed in the period.
    pub max_requests: usize,
    /// The period over which the rate limit is applied.
    pub per_period: RateLimitPeriod,
}

impl RateLimit {
    /// Create a new [`RateLimit`].
    pub fn new(max_requests: usize, per_period: RateLimitPeriod) -> Self {
        Self {
            max_requests,
            per_period,
        }
    }

    /// A rate limit of `max_requests` per second, with a floor of one.
    pub fn per_second(max_requests: usize) -> Self {
        Self::new(max_requests.max(1), RateLimitPeriod::Second)
    }

    /// Create a [`RateLimiter`] for this rate limit.
    pub fn to_rate_limiter(&self) -> RateLimiter {
        // We refill the whole bucket once per period, starting full. Two
        // back-to-back runs may briefly exceed the limit, in which case the
        // service throttles us and we retry.
        RateLimiter::builder()
            .initial(self.max_requests)
            .refill(self.max_requests)
            .max(self.max_requests)
            .interval(self.per_period.to_duration())
            .build()
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.max_requests, self.per_period)
    }
}

impl FromStr for RateLimit {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parse = |s: &str| -> Result<_> {
            let mut parts = s.splitn(2, '/');
            let max_requests = parts
                .next()
                .ok_or_else(|| anyhow!("Missing max requests"))?
                .parse::<usize>()?;
            let per_period = parts
                .next()
                .ok_or_else(|| anyhow!("Missing period"))?
                .parse::<RateLimitPeriod>()?;
            if max_requests == 0 {
                return Err(anyhow!("Max requests must be at least 1"));
            }
            Ok(Self {
                max_requests,
                per_period,
            })
        };
        parse(s).with_context(|| format!("Failed to parse rate limit: {:?}", s))
    }
}
