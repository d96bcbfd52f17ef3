//! Demonstration domain model: `User`/`Group` aggregates exercising the
//! whole persistence core end to end.
//!
//! This module is not part of the core's public contract — it exists to
//! show how a domain author builds against the core: a builder seeds a
//! [`PersistentProperties`] with scalar fields and lazy closures that read
//! the ambient transaction; mutation helpers wrap writes in
//! [`with_current_read_write_transaction`], update storage, and publish
//! domain events; write-through listeners translate those events into the
//! in-memory adapter's native read/update calls.

use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::debug::{debug_value, DebugEntry, DebugSnapshotValue};
use crate::error::Result;
use crate::events::{DomainEvent, EventSubscriptionManager, Listener};
use crate::props::PersistentProperties;
use crate::storage::memory::MemoryHandle;
use crate::tx::{current_transaction, with_current_read_write_transaction, CurrentTx, ReadWriteTransaction};

/// The concrete adapter handle this domain model is wired against.
pub type Handle = MemoryHandle<DatabaseState>;

/// Domain-level errors: example domain errors, not part of the core's
/// error surface.
#[derive(Debug, Error)]
pub enum DomainError {
    /// Raised by [`UserRepository::create`] on a duplicate email.
    #[error("email `{0}` is already in use")]
    UserEmailNotUnique(String),
    /// Raised by [`GroupRepository::create`] on a duplicate name.
    #[error("group name `{0}` is already in use")]
    GroupNameNotUnique(String),
}

/// A user's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserStatus {
    /// Active and usable.
    Enabled,
    /// Deactivated; retained but not usable.
    Disabled,
}

impl DebugSnapshotValue for UserStatus {
    fn debug_entry(&self) -> DebugEntry {
        debug_value(self)
    }
}

/// A user row as stored by the in-memory adapter.
#[derive(Debug, Clone)]
pub struct UserRow {
    id: Uuid,
    email: String,
    first_name: String,
    last_name: String,
    status: UserStatus,
}

/// A group row as stored by the in-memory adapter.
#[derive(Debug, Clone)]
pub struct GroupRow {
    id: Uuid,
    name: String,
}

/// The in-memory adapter's domain state: aggregate-root snapshots keyed by
/// identity, plus the user/group membership association set.
#[derive(Debug, Clone, Default)]
pub struct DatabaseState {
    users: im::HashMap<Uuid, UserRow>,
    groups: im::HashMap<Uuid, GroupRow>,
    memberships: im::HashSet<(Uuid, Uuid)>,
}

/// Fields required to create a new user.
pub struct NewUserSpec {
    /// Unique email address.
    pub email: String,
    /// Given name.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
}

/// Fields required to create a new group.
pub struct NewGroupSpec {
    /// Unique group name.
    pub name: String,
}

// --- Domain events -----------------------------------------------------

struct UserCreated(UserRow);
impl DomainEvent for UserCreated {}

struct UserNameUpdated {
    id: Uuid,
    first_name: String,
    last_name: String,
}
impl DomainEvent for UserNameUpdated {}

struct GroupCreated(GroupRow);
impl DomainEvent for GroupCreated {}

struct GroupNameUpdated {
    id: Uuid,
    name: String,
}
impl DomainEvent for GroupNameUpdated {}

struct MembershipAdded {
    user_id: Uuid,
    group_id: Uuid,
}
impl DomainEvent for MembershipAdded {}

/// Register the write-through listeners that translate domain events into
/// the in-memory adapter's native mutations. Call once per
/// [`EventSubscriptionManager`] before issuing any mutating transaction.
pub fn register_listeners(events: &EventSubscriptionManager<Handle>) {
    events.subscribe(Listener::new::<UserCreated, _, _>(|event, tx| {
        let row = event.0.clone();
        async move {
            tx.handle().update(move |state| {
                let mut next = state.clone();
                next.users.insert(row.id, row.clone());
                next
            });
            Ok(())
        }
    }));

    events.subscribe(Listener::new::<UserNameUpdated, _, _>(|event, tx| {
        let id = event.id;
        let first_name = event.first_name.clone();
        let last_name = event.last_name.clone();
        async move {
            tx.handle().update(move |state| {
                let mut next = state.clone();
                if let Some(row) = next.users.get_mut(&id) {
                    row.first_name = first_name.clone();
                    row.last_name = last_name.clone();
                }
                next
            });
            Ok(())
        }
    }));

    events.subscribe(Listener::new::<GroupCreated, _, _>(|event, tx| {
        let row = event.0.clone();
        async move {
            tx.handle().update(move |state| {
                let mut next = state.clone();
                next.groups.insert(row.id, row.clone());
                next
            });
            Ok(())
        }
    }));

    events.subscribe(Listener::new::<GroupNameUpdated, _, _>(|event, tx| {
        let id = event.id;
        let name = event.name.clone();
        async move {
            tx.handle().update(move |state| {
                let mut next = state.clone();
                if let Some(row) = next.groups.get_mut(&id) {
                    row.name = name.clone();
                }
                next
            });
            Ok(())
        }
    }));

    events.subscribe(Listener::new::<MembershipAdded, _, _>(|event, tx| {
        let user_id = event.user_id;
        let group_id = event.group_id;
        async move {
            tx.handle().update(move |state| {
                let mut next = state.clone();
                next.memberships.insert((user_id, group_id));
                next
            });
            Ok(())
        }
    }));
}

fn current_handle() -> Result<Arc<Handle>> {
    Ok(match current_transaction::<Handle>()? {
        CurrentTx::ReadOnly(tx) => tx.handle().clone(),
        CurrentTx::ReadWrite(tx) => tx.handle().clone(),
    })
}

/// A user aggregate: scalar fields are `Resolved`; `groups()` is a lazy
/// property that reads the ambient transaction's membership relation on
/// first access and memoizes it. Fields are seeded directly by
/// `from_row` rather than through reflection over a method/field naming
/// convention.
pub struct User {
    id: Uuid,
    props: PersistentProperties,
}

impl User {
    fn from_row(row: &UserRow) -> Arc<User> {
        let props = PersistentProperties::new();
        props.set("email", row.email.clone());
        props.set("first_name", row.first_name.clone());
        props.set("last_name", row.last_name.clone());
        props.set("status", row.status);
        let id = row.id;
        props.set_lazy::<Vec<Uuid>, _, _>("groups", move || async move {
            let handle = current_handle()?;
            let state = handle.read();
            Ok(state
                .memberships
                .iter()
                .filter(|(u, _)| *u == id)
                .map(|(_, g)| *g)
                .collect())
        });
        props.set_debug_property_order(vec![
            "email".to_string(),
            "first_name".to_string(),
            "last_name".to_string(),
            "status".to_string(),
            "groups".to_string(),
        ]);
        Arc::new(User { id: row.id, props })
    }

    /// This user's identity.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Email address.
    pub fn email(&self) -> Result<String> {
        self.props.get("email")
    }

    /// Given name.
    pub fn first_name(&self) -> Result<String> {
        self.props.get("first_name")
    }

    /// Family name.
    pub fn last_name(&self) -> Result<String> {
        self.props.get("last_name")
    }

    /// Lifecycle status.
    pub fn status(&self) -> Result<UserStatus> {
        self.props.get("status")
    }

    /// The ids of groups this user belongs to (lazy, memoized; requires an
    /// ambient transaction on first resolution).
    pub async fn groups(&self) -> Result<Vec<Uuid>> {
        self.props.get_lazy("groups").await
    }

    /// A debug dump of this aggregate's properties in declaration order.
    pub fn debug_snapshot(&self) -> Vec<(String, DebugEntry)> {
        self.props.debug_snapshot()
    }

    /// Uppercase the name fields, persist via a domain event, and update
    /// this in-memory instance's resolved cells in place via
    /// `updateIfResolved`, without re-invoking the original producer.
    pub async fn update_name(&self, first_name: &str, last_name: &str) -> Result<()> {
        let first_upper = first_name.to_uppercase();
        let last_upper = last_name.to_uppercase();
        let id = self.id;
        with_current_read_write_transaction::<Handle, _, _, _>(move |tx| {
            let first_upper = first_upper.clone();
            let last_upper = last_upper.clone();
            async move {
                tx.notify(UserNameUpdated {
                    id,
                    first_name: first_upper,
                    last_name: last_upper,
                })
                .await
            }
        })
        .await?;
        self.props
            .update_if_resolved::<String>("first_name", |_| first_name.to_uppercase())?;
        self.props
            .update_if_resolved::<String>("last_name", |_| last_name.to_uppercase())?;
        Ok(())
    }

    /// Record this user's membership in `group`, publish the event, and
    /// reset this user's own `groups` cache so the next read reloads it.
    /// Only this aggregate's cache is invalidated; the other side of the
    /// relation (`group.members()`) is not touched until it is itself
    /// refreshed or mutated.
    pub async fn add_membership_to(&self, group: &Group) -> Result<()> {
        let user_id = self.id;
        let group_id = group.id;
        with_current_read_write_transaction::<Handle, _, _, _>(move |tx| async move {
            tx.notify(MembershipAdded { user_id, group_id }).await
        })
        .await?;
        self.props.reset_lazy("groups");
        Ok(())
    }
}

/// A group aggregate, mirroring [`User`] with a lazy `members()` property.
pub struct Group {
    id: Uuid,
    props: PersistentProperties,
}

impl Group {
    fn from_row(row: &GroupRow) -> Arc<Group> {
        let props = PersistentProperties::new();
        props.set("name", row.name.clone());
        let id = row.id;
        props.set_lazy::<Vec<Uuid>, _, _>("members", move || async move {
            let handle = current_handle()?;
            let state = handle.read();
            Ok(state
                .memberships
                .iter()
                .filter(|(_, g)| *g == id)
                .map(|(u, _)| *u)
                .collect())
        });
        props.set_debug_property_order(vec!["name".to_string(), "members".to_string()]);
        Arc::new(Group { id: row.id, props })
    }

    /// This group's identity.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Group name.
    pub fn name(&self) -> Result<String> {
        self.props.get("name")
    }

    /// Ids of users that are members (lazy, memoized).
    pub async fn members(&self) -> Result<Vec<Uuid>> {
        self.props.get_lazy("members").await
    }

    /// A debug dump of this aggregate's properties in declaration order.
    pub fn debug_snapshot(&self) -> Vec<(String, DebugEntry)> {
        self.props.debug_snapshot()
    }

    /// Uppercase the name, persist via a domain event, and update this
    /// in-memory instance's resolved cell in place.
    pub async fn update_name(&self, name: &str) -> Result<()> {
        let upper = name.to_uppercase();
        let id = self.id;
        with_current_read_write_transaction::<Handle, _, _, _>(move |tx| {
            let upper = upper.clone();
            async move { tx.notify(GroupNameUpdated { id, name: upper }).await }
        })
        .await?;
        self.props
            .update_if_resolved::<String>("name", |_| name.to_uppercase())?;
        Ok(())
    }
}

/// Repository for [`User`] aggregates over [`DatabaseState`].
pub struct UserRepository;

impl UserRepository {
    /// `create(NewUserSpec)` — mint a fresh UUID, default status
    /// `Enabled`, publish `UserCreated`, return the built aggregate.
    pub async fn create(
        tx: &Arc<ReadWriteTransaction<Handle>>,
        spec: NewUserSpec,
    ) -> Result<Arc<User>> {
        if tx
            .handle()
            .read()
            .users
            .values()
            .any(|u| u.email == spec.email)
        {
            return Err(anyhow::Error::new(DomainError::UserEmailNotUnique(spec.email)).into());
        }
        let row = UserRow {
            id: Uuid::new_v4(),
            email: spec.email,
            first_name: spec.first_name,
            last_name: spec.last_name,
            status: UserStatus::Enabled,
        };
        tx.notify(UserCreated(row.clone())).await?;
        Ok(User::from_row(&row))
    }

    /// Fetch a user by id from the given handle (works under either a
    /// read-only or read-write transaction's handle).
    pub fn get(handle: &Handle, id: Uuid) -> Result<Arc<User>> {
        let state = handle.read();
        let row = state
            .users
            .get(&id)
            .ok_or_else(|| crate::error::PersistenceError::NoSuchProperty(format!("user {id}")))?;
        Ok(User::from_row(row))
    }
}

/// Repository for [`Group`] aggregates over [`DatabaseState`].
pub struct GroupRepository;

impl GroupRepository {
    /// `create(NewGroupSpec)` — mint a fresh UUID, publish `GroupCreated`,
    /// return the built aggregate.
    pub async fn create(
        tx: &Arc<ReadWriteTransaction<Handle>>,
        spec: NewGroupSpec,
    ) -> Result<Arc<Group>> {
        if tx
            .handle()
            .read()
            .groups
            .values()
            .any(|g| g.name == spec.name)
        {
            return Err(anyhow::Error::new(DomainError::GroupNameNotUnique(spec.name)).into());
        }
        let row = GroupRow {
            id: Uuid::new_v4(),
            name: spec.name,
        };
        tx.notify(GroupCreated(row.clone())).await?;
        Ok(Group::from_row(&row))
    }

    /// Fetch a group by id from the given handle.
    pub fn get(handle: &Handle, id: Uuid) -> Result<Arc<Group>> {
        let state = handle.read();
        let row = state
            .groups
            .get(&id)
            .ok_or_else(|| crate::error::PersistenceError::NoSuchProperty(format!("group {id}")))?;
        Ok(Group::from_row(row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PersistenceError;
    use crate::lazy_refresh::with_lazy_refresh;
    use crate::storage::memory::MemoryStorage;
    use crate::tx::TransactionManager;

    fn new_manager() -> (Arc<MemoryStorage<DatabaseState>>, TransactionManager<MemoryStorage<DatabaseState>>) {
        let storage = Arc::new(MemoryStorage::<DatabaseState>::new());
        let events = Arc::new(EventSubscriptionManager::new());
        register_listeners(&events);
        let manager = TransactionManager::new(storage.clone(), events);
        (storage, manager)
    }

    #[tokio::test]
    async fn user_crud_scenario() {
        let (_storage, mgr) = new_manager();

        let id = mgr
            .with_read_write_transaction(0, |tx| async move {
                let user = UserRepository::create(
                    &tx,
                    NewUserSpec {
                        email: "j@e.com".to_string(),
                        first_name: "John".to_string(),
                        last_name: "Bell".to_string(),
                    },
                )
                .await?;
                assert_eq!(user.status().unwrap(), UserStatus::Enabled);
                Ok(user.id())
            })
            .await
            .unwrap();

        mgr.with_read_only_transaction(|tx| async move {
            let user = UserRepository::get(tx.handle(), id)?;
            assert_eq!(user.email().unwrap(), "j@e.com");
            assert_eq!(user.first_name().unwrap(), "John");
            Ok(())
        })
        .await
        .unwrap();

        mgr.with_read_write_transaction(0, move |tx| async move {
            let user = UserRepository::get(tx.handle(), id)?;
            user.update_name("JOHN", "BELL").await
        })
        .await
        .unwrap();

        mgr.with_read_only_transaction(|tx| async move {
            let user = UserRepository::get(tx.handle(), id)?;
            assert_eq!(user.first_name().unwrap(), "JOHN");
            assert_eq!(user.last_name().unwrap(), "BELL");
            assert_eq!(user.status().unwrap(), UserStatus::Enabled);
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn group_crud_scenario() {
        let (_storage, mgr) = new_manager();

        let id = mgr
            .with_read_write_transaction(0, |tx| async move {
                let group = GroupRepository::create(
                    &tx,
                    NewGroupSpec {
                        name: "group1".to_string(),
                    },
                )
                .await?;
                Ok(group.id())
            })
            .await
            .unwrap();

        mgr.with_read_write_transaction(0, move |tx| async move {
            let group = GroupRepository::get(tx.handle(), id)?;
            group.update_name("GROUP1").await
        })
        .await
        .unwrap();

        mgr.with_read_only_transaction(|tx| async move {
            let group = GroupRepository::get(tx.handle(), id)?;
            assert_eq!(group.name().unwrap(), "GROUP1");
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn membership_and_lazy_invalidation_scenario() {
        let (_storage, mgr) = new_manager();

        let (user_id, group_id) = mgr
            .with_read_write_transaction(0, |tx| async move {
                let user = UserRepository::create(
                    &tx,
                    NewUserSpec {
                        email: "u@e.com".to_string(),
                        first_name: "U".to_string(),
                        last_name: "Ser".to_string(),
                    },
                )
                .await?;
                let group = GroupRepository::create(
                    &tx,
                    NewGroupSpec {
                        name: "g".to_string(),
                    },
                )
                .await?;

                assert!(user.groups().await.unwrap().is_empty());
                assert!(group.members().await.unwrap().is_empty());

                user.add_membership_to(&group).await?;

                assert_eq!(user.groups().await.unwrap(), vec![group.id()]);
                assert!(group.members().await.unwrap().is_empty());

                let refreshed = with_lazy_refresh(group.members()).await.unwrap();
                assert_eq!(refreshed, vec![user.id()]);

                Ok((user.id(), group.id()))
            })
            .await
            .unwrap();

        mgr.with_read_only_transaction(|tx| async move {
            let user = UserRepository::get(tx.handle(), user_id)?;
            let group = GroupRepository::get(tx.handle(), group_id)?;
            assert_eq!(user.groups().await.unwrap(), vec![group_id]);
            assert_eq!(group.members().await.unwrap(), vec![user_id]);
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn lazy_access_outside_a_transaction_scenario() {
        let (_storage, mgr) = new_manager();

        let group_id = mgr
            .with_read_write_transaction(0, |tx| async move {
                let group = GroupRepository::create(
                    &tx,
                    NewGroupSpec {
                        name: "outside".to_string(),
                    },
                )
                .await?;
                Ok(group.id())
            })
            .await
            .unwrap();

        let group = mgr
            .with_read_only_transaction(move |tx| async move { GroupRepository::get(tx.handle(), group_id) })
            .await
            .unwrap();

        let err = group.members().await.unwrap_err();
        assert!(matches!(err, PersistenceError::CurrentTransactionUnavailable));

        mgr.with_read_only_transaction(|_tx| async {
            assert!(group.members().await.unwrap().is_empty());
            Ok(())
        })
        .await
        .unwrap();

        assert!(group.members().await.unwrap().is_empty());

        let err = with_lazy_refresh(group.members()).await.unwrap_err();
        assert!(matches!(err, PersistenceError::CurrentTransactionUnavailable));
    }

    #[tokio::test]
    async fn retry_scenario() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let (_storage, mgr) = new_manager();
        let attempt = Arc::new(AtomicU32::new(0));

        let attempt2 = attempt.clone();
        mgr.with_read_write_transaction(5, move |_tx| {
            let attempt = attempt2.clone();
            async move {
                let n = attempt.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    return Err(PersistenceError::TransactionRetry(Box::new(
                        PersistenceError::Other(anyhow::anyhow!("not yet")),
                    )));
                }
                Ok(())
            }
        })
        .await
        .unwrap();
        assert_eq!(attempt.load(Ordering::SeqCst), 3);

        let attempt = Arc::new(AtomicU32::new(0));
        let attempt2 = attempt.clone();
        let outcome: Result<()> = mgr
            .with_read_write_transaction(1, move |_tx| {
                let attempt = attempt2.clone();
                async move {
                    attempt.fetch_add(1, Ordering::SeqCst);
                    Err(PersistenceError::TransactionRetry(Box::new(
                        PersistenceError::Other(anyhow::anyhow!("never succeeds")),
                    )))
                }
            })
            .await;
        // the retry budget is exhausted, so the caller sees the unwrapped
        // cause, not a TransactionRetry wrapper.
        match outcome {
            Err(PersistenceError::Other(e)) => assert_eq!(e.to_string(), "never succeeds"),
            other => panic!("expected the unwrapped cause, got {other:?}"),
        }
        assert_eq!(attempt.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_tx_guard_scenario() {
        let (_storage, mgr) = new_manager();
        let mgr = Arc::new(mgr);
        let inner = mgr.clone();
        mgr.with_read_only_transaction(move |_tx| {
            let inner = inner.clone();
            async move {
                let nested = inner.with_read_only_transaction(|_tx| async { Ok(()) }).await;
                assert!(matches!(nested, Err(PersistenceError::ConcurrentTransaction)));
                Ok(())
            }
        })
        .await
        .unwrap();
    }
}
