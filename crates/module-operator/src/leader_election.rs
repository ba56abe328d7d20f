//! Lease based leader election.
//!
//! Only the replica holding the `<app>-leader` [`Lease`] runs controllers. The lease is renewed
//! periodically and the holder steps down once it can no longer renew it in time.

use std::time::Duration;

use k8s_openapi::{
    api::coordination::v1::{Lease, LeaseSpec},
    apimachinery::pkg::apis::meta::v1::MicroTime,
    chrono::{DateTime, TimeDelta, Utc},
};
use kube::{
    api::{ObjectMeta, PostParams},
    Api,
};
use snafu::{ResultExt, Snafu};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::{client::api_error_code, utils::signal::ShutdownToken};

pub const LEASE_DURATION: Duration = Duration::from_secs(15);
pub const RENEW_INTERVAL: Duration = Duration::from_secs(5);
pub const RETRY_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get lease {name:?}"))]
    GetLease { source: kube::Error, name: String },

    #[snafu(display("failed to create lease {name:?}"))]
    CreateLease { source: kube::Error, name: String },

    #[snafu(display("failed to update lease {name:?}"))]
    UpdateLease { source: kube::Error, name: String },

    #[snafu(display("lost leadership of lease {name:?}"))]
    LeaseLost { name: String },
}

/// The name of the lease used by the application `app_name`.
pub fn lease_name(app_name: &str) -> String {
    format!("{app_name}-leader")
}

/// The holder identity of this process, the pod host name.
pub fn default_identity() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_owned())
}

/// Whether `identity` may take or keep the lease described by `spec` at `now`.
pub fn can_acquire(spec: Option<&LeaseSpec>, identity: &str, now: DateTime<Utc>) -> bool {
    let Some(spec) = spec else {
        return true;
    };
    match spec.holder_identity.as_deref() {
        None | Some("") => true,
        Some(holder) if holder == identity => true,
        Some(_) => is_expired(spec, now),
    }
}

fn is_expired(spec: &LeaseSpec, now: DateTime<Utc>) -> bool {
    let Some(MicroTime(renewed)) = spec.renew_time.as_ref().or(spec.acquire_time.as_ref()) else {
        return true;
    };
    let duration = TimeDelta::seconds(spec.lease_duration_seconds.unwrap_or_default().into());
    *renewed + duration < now
}

/// The spec written when `identity` takes or renews the lease.
pub fn claim(
    spec: Option<&LeaseSpec>,
    identity: &str,
    now: DateTime<Utc>,
    duration: Duration,
) -> LeaseSpec {
    let mut claimed = spec.cloned().unwrap_or_default();
    if claimed.holder_identity.as_deref() != Some(identity) {
        if claimed.holder_identity.is_some() {
            claimed.lease_transitions = Some(claimed.lease_transitions.unwrap_or_default() + 1);
        }
        claimed.holder_identity = Some(identity.to_owned());
        claimed.acquire_time = Some(MicroTime(now));
    }
    claimed.renew_time = Some(MicroTime(now));
    claimed.lease_duration_seconds = Some(i32::try_from(duration.as_secs()).unwrap_or(i32::MAX));
    claimed
}

pub struct LeaderElector {
    api: Api<Lease>,
    name: String,
    identity: String,
}

impl LeaderElector {
    pub fn new(client: kube::Client, namespace: &str, app_name: &str, identity: String) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: lease_name(app_name),
            identity,
        }
    }

    /// Takes or renews the lease. Returns `false` if somebody else holds it.
    pub async fn try_acquire_or_renew(&self) -> Result<bool, Error> {
        let now = Utc::now();
        let current = self
            .api
            .get_opt(&self.name)
            .await
            .context(GetLeaseSnafu { name: &self.name })?;

        match current {
            None => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(self.name.clone()),
                        ..ObjectMeta::default()
                    },
                    spec: Some(claim(None, &self.identity, now, LEASE_DURATION)),
                };
                match self.api.create(&PostParams::default(), &lease).await {
                    Ok(_) => Ok(true),
                    // Somebody else created the lease first
                    Err(err) if api_error_code(&err) == Some(409) => Ok(false),
                    Err(err) => Err(err).context(CreateLeaseSnafu { name: &self.name }),
                }
            }
            Some(lease) if can_acquire(lease.spec.as_ref(), &self.identity, now) => {
                let lease = Lease {
                    spec: Some(claim(lease.spec.as_ref(), &self.identity, now, LEASE_DURATION)),
                    ..lease
                };
                match self
                    .api
                    .replace(&self.name, &PostParams::default(), &lease)
                    .await
                {
                    Ok(_) => Ok(true),
                    Err(err) if api_error_code(&err) == Some(409) => Ok(false),
                    Err(err) => Err(err).context(UpdateLeaseSnafu { name: &self.name }),
                }
            }
            Some(_) => Ok(false),
        }
    }

    /// Blocks until the lease is held. Returns `false` if `shutdown` fired first.
    pub async fn acquire(&self, shutdown: &ShutdownToken) -> Result<bool, Error> {
        info!(lease = %self.name, identity = %self.identity, "Waiting for leadership");
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(lease = %self.name, "Acquired leadership");
                    return Ok(true);
                }
                Ok(false) => debug!(lease = %self.name, "Lease is held by another replica"),
                Err(err) => warn!(
                    error = &err as &dyn std::error::Error,
                    "Failed to acquire lease, retrying"
                ),
            }

            tokio::select! {
                () = sleep(RETRY_INTERVAL) => {}
                () = shutdown.cancelled() => return Ok(false),
            }
        }
    }

    /// Keeps renewing the lease until `shutdown` fires. Fails once leadership is lost.
    pub async fn hold(&self, shutdown: ShutdownToken) -> Result<(), Error> {
        let mut last_renewed = Instant::now();
        loop {
            tokio::select! {
                () = sleep(RENEW_INTERVAL) => {}
                () = shutdown.cancelled() => return Ok(()),
            }

            match self.try_acquire_or_renew().await {
                Ok(true) => last_renewed = Instant::now(),
                Ok(false) => return LeaseLostSnafu { name: &self.name }.fail(),
                Err(err) => {
                    warn!(
                        error = &err as &dyn std::error::Error,
                        "Failed to renew lease"
                    );
                    if last_renewed.elapsed() >= LEASE_DURATION {
                        return LeaseLostSnafu { name: &self.name }.fail();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + seconds, 0).unwrap()
    }

    fn held_by(holder: &str, renewed: i64) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(holder.to_owned()),
            renew_time: Some(MicroTime(at(renewed))),
            lease_duration_seconds: Some(15),
            ..LeaseSpec::default()
        }
    }

    #[rstest]
    #[case::unheld(None, 0, true)]
    #[case::own(Some(held_by("me", 0)), 1, true)]
    #[case::other_fresh(Some(held_by("other", 0)), 10, false)]
    #[case::other_expired(Some(held_by("other", 0)), 16, true)]
    fn acquisition(#[case] spec: Option<LeaseSpec>, #[case] now: i64, #[case] expected: bool) {
        assert_eq!(can_acquire(spec.as_ref(), "me", at(now)), expected);
    }

    #[test]
    fn taking_over_counts_a_transition() {
        let claimed = claim(Some(&held_by("other", 0)), "me", at(20), LEASE_DURATION);

        assert_eq!(claimed.holder_identity.as_deref(), Some("me"));
        assert_eq!(claimed.lease_transitions, Some(1));
        assert_eq!(claimed.acquire_time, Some(MicroTime(at(20))));
        assert_eq!(claimed.lease_duration_seconds, Some(15));
    }

    #[test]
    fn renewing_keeps_acquire_time() {
        let mut spec = held_by("me", 5);
        spec.acquire_time = Some(MicroTime(at(0)));
        let renewed = claim(Some(&spec), "me", at(10), LEASE_DURATION);

        assert_eq!(renewed.acquire_time, Some(MicroTime(at(0))));
        assert_eq!(renewed.renew_time, Some(MicroTime(at(10))));
        assert_eq!(renewed.lease_transitions, None);
    }

    #[test]
    fn lease_is_named_after_app() {
        assert_eq!(
            lease_name("module-lifecycle-operator"),
            "module-lifecycle-operator-leader"
        );
    }
}
