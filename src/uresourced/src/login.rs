// Copyright (c) 2026 The uresourced developers
//
// SPDX-License-Identifier: Apache-2.0
//

//! Login state tracking.
//!
//! Watches the login manager for seat/session churn and publishes debounced
//! snapshots of which users are logged in and which of them own an active
//! session on a graphical seat.

use std::time::Duration;

use anyhow::{Context as _, Result};
use futures::StreamExt;
use slog::{debug, error, warn, Logger};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use zbus::zvariant::OwnedObjectPath;
use zbus::{dbus_proxy, CacheProperties, Connection, MatchRule, MessageStream, MessageType};

/// Quiet period after the last login event before a snapshot is taken.
const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// A sorted set of user IDs supporting ordered diffing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserSet(Vec<u32>);

impl UserSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, uid: u32) {
        if let Err(position) = self.0.binary_search(&uid) {
            self.0.insert(position, uid);
        }
    }

    pub fn contains(&self, uid: u32) -> bool {
        self.0.binary_search(&uid).is_ok()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<u32> for UserSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let mut set = UserSet::new();
        for uid in iter {
            set.insert(uid);
        }
        set
    }
}

/// The debounced login state.
///
/// `graphical_users` holds every user with at least one active session on a
/// graphical seat and is always a subset of `all_users`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginSnapshot {
    pub all_users: UserSet,
    pub graphical_users: UserSet,
}

#[dbus_proxy(
    interface = "org.freedesktop.login1.Manager",
    default_service = "org.freedesktop.login1",
    default_path = "/org/freedesktop/login1"
)]
trait LoginManager {
    fn list_seats(&self) -> zbus::Result<Vec<(String, OwnedObjectPath)>>;

    fn list_users(&self) -> zbus::Result<Vec<(u32, String, OwnedObjectPath)>>;
}

#[dbus_proxy(
    interface = "org.freedesktop.login1.Seat",
    default_service = "org.freedesktop.login1"
)]
trait Seat {
    #[dbus_proxy(property)]
    fn can_graphical(&self) -> zbus::Result<bool>;

    #[dbus_proxy(property)]
    fn sessions(&self) -> zbus::Result<Vec<(String, OwnedObjectPath)>>;
}

#[dbus_proxy(
    interface = "org.freedesktop.login1.Session",
    default_service = "org.freedesktop.login1"
)]
trait Session {
    #[dbus_proxy(property)]
    fn active(&self) -> zbus::Result<bool>;

    #[dbus_proxy(property)]
    fn user(&self) -> zbus::Result<(u32, OwnedObjectPath)>;
}

/// Watches login state; emits a [`LoginSnapshot`] on the returned channel
/// whenever the state has changed and settled.
pub struct LoginMonitor {
    task: JoinHandle<()>,
}

impl LoginMonitor {
    /// Start watching. One snapshot of the current state is emitted right
    /// away.
    pub async fn start(
        connection: &Connection,
        logger: &Logger,
    ) -> Result<(Self, mpsc::UnboundedReceiver<LoginSnapshot>)> {
        let rule = MatchRule::builder()
            .msg_type(MessageType::Signal)
            .sender("org.freedesktop.login1")?
            .path_namespace("/org/freedesktop/login1")?
            .build();
        let stream = MessageStream::for_match_rule(rule, connection, Some(64))
            .await
            .context("could not subscribe to login manager signals")?;

        let (tx, rx) = mpsc::unbounded_channel();
        let connection = connection.clone();
        let logger = logger.clone();

        let task = tokio::task::spawn_local(async move {
            run(stream, connection, tx, logger).await;
        });

        Ok((LoginMonitor { task }, rx))
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

async fn run(
    mut stream: MessageStream,
    connection: Connection,
    tx: mpsc::UnboundedSender<LoginSnapshot>,
    logger: Logger,
) {
    // Initial state, before any change is seen.
    if tx.send(snapshot(&connection, &logger).await).is_err() {
        return;
    }

    let mut settle: Option<Instant> = None;
    loop {
        let deadline = settle;
        let settled = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            message = stream.next() => match message {
                // Any activity restarts the quiet period.
                Some(_) => settle = Some(Instant::now() + SETTLE_DELAY),
                None => break,
            },
            _ = settled => {
                settle = None;
                if tx.send(snapshot(&connection, &logger).await).is_err() {
                    break;
                }
            }
        }
    }
}

/// Take a snapshot of the current login state. Enumeration failure fails
/// closed: the snapshot comes back empty, as if nobody were logged in.
async fn snapshot(connection: &Connection, logger: &Logger) -> LoginSnapshot {
    match enumerate(connection, logger).await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            error!(logger, "could not enumerate login state"; "error" => %err);
            LoginSnapshot::default()
        }
    }
}

async fn session_is_active_for(
    connection: &Connection,
    path: &OwnedObjectPath,
) -> Result<Option<u32>> {
    let session = SessionProxy::builder(connection)
        .path(path.clone())?
        .cache_properties(CacheProperties::No)
        .build()
        .await?;

    let (uid, _) = session.user().await?;
    if session.active().await? {
        Ok(Some(uid))
    } else {
        Ok(None)
    }
}

async fn enumerate(connection: &Connection, logger: &Logger) -> Result<LoginSnapshot> {
    let manager = LoginManagerProxy::builder(connection)
        .cache_properties(CacheProperties::No)
        .build()
        .await?;

    let mut snapshot = LoginSnapshot::default();

    for (seat_id, seat_path) in manager.list_seats().await.context("could not list seats")? {
        let seat = SeatProxy::builder(connection)
            .path(seat_path)?
            .cache_properties(CacheProperties::No)
            .build()
            .await?;

        // Only graphical seats matter; the protected session is assumed to
        // live on one.
        match seat.can_graphical().await {
            Ok(true) => {}
            Ok(false) => continue,
            Err(err) => {
                warn!(logger, "could not check whether seat is graphical, ignoring it";
                      "seat" => %seat_id, "error" => %err);
                continue;
            }
        }

        let sessions = match seat.sessions().await {
            Ok(sessions) => sessions,
            Err(err) => {
                warn!(logger, "could not list sessions of seat, ignoring it";
                      "seat" => %seat_id, "error" => %err);
                continue;
            }
        };

        for (session_id, session_path) in sessions {
            match session_is_active_for(connection, &session_path).await {
                Ok(Some(uid)) => snapshot.graphical_users.insert(uid),
                Ok(None) => {}
                // Sessions routinely vanish while we look at them.
                Err(err) => {
                    debug!(logger, "ignoring session"; "session" => %session_id, "error" => %err);
                }
            }
        }
    }

    for (uid, _, _) in manager.list_users().await.context("could not list users")? {
        snapshot.all_users.insert(uid);
    }

    // A user active on a seat is logged in by definition.
    let graphical = snapshot.graphical_users.clone();
    for uid in graphical.iter() {
        snapshot.all_users.insert(uid);
    }

    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_set_stays_sorted_and_unique() {
        let mut set = UserSet::new();
        set.insert(1001);
        set.insert(1000);
        set.insert(1001);
        set.insert(999);

        assert_eq!(set.iter().collect::<Vec<_>>(), vec![999, 1000, 1001]);
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn user_set_membership() {
        let set: UserSet = [1000, 1002].into_iter().collect();
        assert!(set.contains(1000));
        assert!(!set.contains(1001));
        assert!(set.contains(1002));
    }

    #[test]
    fn empty_snapshot_has_no_users() {
        let snapshot = LoginSnapshot::default();
        assert!(snapshot.all_users.is_empty());
        assert!(snapshot.graphical_users.is_empty());
    }
}
