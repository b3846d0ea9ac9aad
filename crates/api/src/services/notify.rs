//! Live notification fan-out to connected users and admins.
//!
//! The registry is process-local: it only reaches sockets connected to this
//! instance. Running several API instances needs sticky sessions or a shared
//! pub/sub channel feeding each instance's `Notifier`.
//!
//! Nothing is persisted or replayed. A user with no open connection simply
//! misses the event and reads the current state over REST on reconnect.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::{DashMap, DashSet};
use mercato_core::{Order, OrderId, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::models::SessionUser;

/// Events buffered per connection before new ones are dropped.
pub const CONNECTION_BUFFER: usize = 64;

/// Identifies one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Events pushed to clients. Each carries the full order snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Order status changed (other than shipping milestones).
    OrderUpdated(Order),
    /// A new order needs attention (admins only).
    NewOrder(Order),
    /// Payment status changed.
    PaymentUpdate(Order),
    /// Order shipped, out for delivery or delivered.
    ShippingUpdate(Order),
}

impl ServerEvent {
    /// The order snapshot carried by the event.
    #[must_use]
    pub const fn order(&self) -> &Order {
        match self {
            Self::OrderUpdated(order)
            | Self::NewOrder(order)
            | Self::PaymentUpdate(order)
            | Self::ShippingUpdate(order) => order,
        }
    }

    /// Wire name of the event.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::OrderUpdated(_) => "order_updated",
            Self::NewOrder(_) => "new_order",
            Self::PaymentUpdate(_) => "payment_update",
            Self::ShippingUpdate(_) => "shipping_update",
        }
    }
}

/// Messages clients may send over their connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    JoinOrderRoom { order_id: OrderId },
    LeaveOrderRoom { order_id: OrderId },
}

/// Who should receive an event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Audience {
    pub user: Option<UserId>,
    pub admins: bool,
    pub order_room: Option<OrderId>,
}

impl Audience {
    /// The order's owner, every admin and the order's room.
    #[must_use]
    pub const fn everyone_for(order: &Order) -> Self {
        Self {
            user: Some(order.user_id),
            admins: true,
            order_room: Some(order.id),
        }
    }

    /// The order's owner and the order's room.
    #[must_use]
    pub const fn owner_and_room(order: &Order) -> Self {
        Self {
            user: Some(order.user_id),
            admins: false,
            order_room: Some(order.id),
        }
    }
}

struct Connection {
    user_id: UserId,
    sender: mpsc::Sender<ServerEvent>,
    rooms: HashSet<OrderId>,
}

/// Registry of live connections, indexed by user, admin group and order room.
#[derive(Default)]
pub struct Notifier {
    connections: DashMap<ConnectionId, Connection>,
    by_user: DashMap<UserId, HashSet<ConnectionId>>,
    admins: DashSet<ConnectionId>,
    rooms: DashMap<OrderId, HashSet<ConnectionId>>,
    last_id: AtomicU64,
}

impl Notifier {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for an authenticated user.
    ///
    /// Admins join the admin group automatically. The receiver yields every
    /// event addressed to this connection until [`Notifier::unregister`].
    pub fn register(&self, user: &SessionUser) -> (ConnectionId, mpsc::Receiver<ServerEvent>) {
        let id = ConnectionId(self.last_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (sender, receiver) = mpsc::channel(CONNECTION_BUFFER);

        self.connections.insert(
            id,
            Connection {
                user_id: user.id,
                sender,
                rooms: HashSet::new(),
            },
        );
        self.by_user.entry(user.id).or_default().insert(id);
        if user.is_admin() {
            self.admins.insert(id);
        }

        debug!(connection = %id, user_id = %user.id, admin = user.is_admin(), "Connection registered");
        (id, receiver)
    }

    /// Remove a connection from every index.
    pub fn unregister(&self, id: ConnectionId) {
        let Some((_, connection)) = self.connections.remove(&id) else {
            return;
        };

        self.by_user.remove_if_mut(&connection.user_id, |_, ids| {
            ids.remove(&id);
            ids.is_empty()
        });
        self.admins.remove(&id);
        for order_id in &connection.rooms {
            self.rooms.remove_if_mut(order_id, |_, ids| {
                ids.remove(&id);
                ids.is_empty()
            });
        }

        debug!(connection = %id, "Connection unregistered");
    }

    /// Subscribe a connection to an order's updates. Returns `false` if the
    /// connection is not registered.
    pub fn join_order_room(&self, id: ConnectionId, order_id: OrderId) -> bool {
        let Some(mut connection) = self.connections.get_mut(&id) else {
            return false;
        };
        connection.rooms.insert(order_id);
        drop(connection);

        self.rooms.entry(order_id).or_default().insert(id);
        true
    }

    /// Unsubscribe a connection from an order's updates.
    pub fn leave_order_room(&self, id: ConnectionId, order_id: OrderId) {
        if let Some(mut connection) = self.connections.get_mut(&id) {
            connection.rooms.remove(&order_id);
        }
        self.rooms.remove_if_mut(&order_id, |_, ids| {
            ids.remove(&id);
            ids.is_empty()
        });
    }

    /// Send to every connection of one user. Returns the number reached.
    pub fn notify_user(&self, user_id: UserId, event: &ServerEvent) -> usize {
        self.deliver(self.user_targets(user_id), event)
    }

    /// Send to every admin connection. Returns the number reached.
    pub fn notify_admins(&self, event: &ServerEvent) -> usize {
        self.deliver(self.admin_targets(), event)
    }

    /// Send to every connection subscribed to an order. Returns the number reached.
    pub fn notify_order_room(&self, order_id: OrderId, event: &ServerEvent) -> usize {
        self.deliver(self.room_targets(order_id), event)
    }

    /// Send once to the union of an audience, so a connection that is both
    /// the owner and in the room gets the event a single time.
    pub fn publish(&self, event: &ServerEvent, audience: Audience) -> usize {
        let mut targets = HashSet::new();
        if let Some(user_id) = audience.user {
            targets.extend(self.user_targets(user_id));
        }
        if audience.admins {
            targets.extend(self.admin_targets());
        }
        if let Some(order_id) = audience.order_room {
            targets.extend(self.room_targets(order_id));
        }
        self.deliver(targets, event)
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn user_targets(&self, user_id: UserId) -> HashSet<ConnectionId> {
        self.by_user
            .get(&user_id)
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }

    fn admin_targets(&self) -> HashSet<ConnectionId> {
        self.admins.iter().map(|id| *id).collect()
    }

    fn room_targets(&self, order_id: OrderId) -> HashSet<ConnectionId> {
        self.rooms
            .get(&order_id)
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }

    fn deliver(&self, targets: HashSet<ConnectionId>, event: &ServerEvent) -> usize {
        let mut delivered = 0;
        for id in targets {
            let Some(connection) = self.connections.get(&id) else {
                continue;
            };
            match connection.sender.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        connection = %id,
                        event = event.name(),
                        order_id = %event.order().id,
                        "Connection buffer full, dropping event"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(connection = %id, "Connection closed before delivery");
                }
            }
        }
        delivered
    }
}
