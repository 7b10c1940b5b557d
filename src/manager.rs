//! One façade over many repositories.
//!
//! An [`ItemManager`] lazily creates one [`Repository`] per item type, all
//! sharing the same store handle, table prefix, audit configuration, and
//! check-and-set policy, and offers whole-unit `flush`/`clear` across them.

use std::any::{Any, TypeId};
use std::collections::HashMap;

use futures::future::BoxFuture;

use crate::audit::AuditConfig;
use crate::error::OdmResult;
use crate::repository::Repository;
use crate::schema::{Item, KeyMap};
use crate::state::ItemRef;
use crate::store::StoreClient;

/// Type-erased view of a repository, for cross-type bookkeeping.
trait AnyRepository: Any + Send {
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn clear(&mut self);
    fn set_skip_check_and_set(&mut self, skip: bool);
    fn set_audit(&mut self, audit: AuditConfig);
    fn flush(&mut self) -> BoxFuture<'_, OdmResult<()>>;
}

impl<T: Item, C: StoreClient> AnyRepository for Repository<T, C> {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn clear(&mut self) {
        Repository::clear(self);
    }

    fn set_skip_check_and_set(&mut self, skip: bool) {
        Repository::set_skip_check_and_set(self, skip);
    }

    fn set_audit(&mut self, audit: AuditConfig) {
        Repository::set_audit(self, audit);
    }

    fn flush(&mut self) -> BoxFuture<'_, OdmResult<()>> {
        Box::pin(Repository::flush(self))
    }
}

/// Entry point owning one repository per managed item type.
pub struct ItemManager<C: StoreClient + Clone> {
    store: C,
    table_prefix: String,
    skip_check_and_set: bool,
    audit: AuditConfig,
    repositories: HashMap<TypeId, Box<dyn AnyRepository>>,
}

impl<C: StoreClient + Clone> ItemManager<C> {
    /// Creates a manager over a store handle.
    pub fn new(store: C) -> Self {
        Self::with_table_prefix(store, "")
    }

    /// Creates a manager whose repositories prefix every table name, e.g.
    /// per deployment environment.
    pub fn with_table_prefix(store: C, prefix: &str) -> Self {
        Self {
            store,
            table_prefix: prefix.to_string(),
            skip_check_and_set: false,
            audit: AuditConfig::default(),
            repositories: HashMap::new(),
        }
    }

    /// The repository for `T`, created on first use.
    pub fn repository<T: Item>(&mut self) -> &mut Repository<T, C> {
        let store = self.store.clone();
        let prefix = self.table_prefix.clone();
        let skip = self.skip_check_and_set;
        let audit = self.audit.clone();
        self.repositories
            .entry(TypeId::of::<T>())
            .or_insert_with(|| {
                let mut repository = Repository::<T, C>::with_table_prefix(store, &prefix);
                repository.set_skip_check_and_set(skip);
                repository.set_audit(audit);
                Box::new(repository)
            })
            .as_any_mut()
            .downcast_mut()
            .expect("repository registered under its item type's TypeId")
    }

    /// Applies check-and-set suppression to every current and future
    /// repository.
    pub fn set_skip_check_and_set(&mut self, skip: bool) {
        self.skip_check_and_set = skip;
        for repository in self.repositories.values_mut() {
            repository.set_skip_check_and_set(skip);
        }
    }

    /// Applies an audit configuration to every current and future
    /// repository.
    pub fn set_audit(&mut self, audit: AuditConfig) {
        self.audit = audit.clone();
        for repository in self.repositories.values_mut() {
            repository.set_audit(audit.clone());
        }
    }

    /// Flushes every repository. The first failure aborts the pass;
    /// repositories not yet reached keep their pending changes.
    pub async fn flush(&mut self) -> OdmResult<()> {
        for repository in self.repositories.values_mut() {
            repository.flush().await?;
        }
        Ok(())
    }

    /// Drops every managed entry of every repository.
    pub fn clear(&mut self) {
        for repository in self.repositories.values_mut() {
            repository.clear();
        }
    }

    /// Shorthand for [`Repository::get`] on `T`'s repository.
    pub async fn get<T: Item>(
        &mut self,
        keys: &KeyMap,
        consistent: bool,
    ) -> OdmResult<Option<ItemRef<T>>> {
        self.repository::<T>().get(keys, consistent).await
    }

    /// Shorthand for [`Repository::persist`] on `T`'s repository.
    pub fn persist<T: Item>(&mut self, item: T) -> OdmResult<ItemRef<T>> {
        self.repository::<T>().persist(item)
    }

    /// Shorthand for [`Repository::remove`] on `T`'s repository.
    pub fn remove<T: Item>(&mut self, item: &ItemRef<T>) -> OdmResult<()> {
        self.repository::<T>().remove(item)
    }

    /// Shorthand for [`Repository::detach`] on `T`'s repository.
    pub fn detach<T: Item>(&mut self, item: &ItemRef<T>) -> OdmResult<()> {
        self.repository::<T>().detach(item)
    }

    /// Shorthand for [`Repository::refresh`] on `T`'s repository.
    pub async fn refresh<T: Item>(
        &mut self,
        item: &ItemRef<T>,
        persist_if_not_managed: bool,
    ) -> OdmResult<Option<ItemRef<T>>> {
        self.repository::<T>().refresh(item, persist_if_not_managed).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::fixtures::{Account, Note};
    use crate::store::testing::MemoryStore;

    use aws_sdk_dynamodb::types::AttributeValue;

    fn store() -> MemoryStore {
        MemoryStore::default()
            .with_table("accounts", &["id"])
            .with_table("notes", &["id"])
    }

    #[tokio::test]
    async fn repositories_are_created_once_per_type() {
        let mut manager = ItemManager::new(store());
        manager
            .persist(Note {
                id: "n1".to_string(),
                body: "b".to_string(),
            })
            .unwrap();
        // the same repository instance still tracks the pending item
        assert_eq!(manager.repository::<Note>().managed_count(), 1);
        assert_eq!(manager.repository::<Account>().managed_count(), 0);
    }

    #[tokio::test]
    async fn flush_commits_every_repository() {
        let memory = store();
        let mut manager = ItemManager::new(memory.clone());
        manager
            .persist(Note {
                id: "n1".to_string(),
                body: "b".to_string(),
            })
            .unwrap();
        manager
            .persist(Account {
                id: "a1".to_string(),
                owner: "alice".to_string(),
                balance: 1,
                version: 1,
            })
            .unwrap();
        manager.flush().await.unwrap();

        assert_eq!(memory.row_count("notes"), 1);
        assert_eq!(memory.row_count("accounts"), 1);
    }

    #[tokio::test]
    async fn clear_discards_pending_changes_everywhere() {
        let memory = store();
        let mut manager = ItemManager::new(memory.clone());
        manager
            .persist(Note {
                id: "n1".to_string(),
                body: "b".to_string(),
            })
            .unwrap();
        manager.clear();
        manager.flush().await.unwrap();
        assert_eq!(memory.row_count("notes"), 0);
    }

    #[tokio::test]
    async fn check_and_set_policy_reaches_existing_and_new_repositories() {
        let mut manager = ItemManager::new(store());
        let existing = manager.repository::<Account>();
        assert!(!existing.should_skip_check_and_set());

        manager.set_skip_check_and_set(true);
        assert!(manager.repository::<Account>().should_skip_check_and_set());
        assert!(manager.repository::<Note>().should_skip_check_and_set());
    }

    #[tokio::test]
    async fn table_prefix_applies_to_every_repository() {
        let memory = MemoryStore::default().with_table("test-notes", &["id"]);
        let mut manager = ItemManager::with_table_prefix(memory.clone(), "test-");
        assert_eq!(manager.repository::<Note>().table(), "test-notes");
        manager
            .persist(Note {
                id: "n1".to_string(),
                body: "b".to_string(),
            })
            .unwrap();
        manager.flush().await.unwrap();
        assert_eq!(memory.row_count("test-notes"), 1);
    }

    #[tokio::test]
    async fn convenience_delegates_share_the_identity_map() {
        let memory = store();
        let account = Account {
            id: "a1".to_string(),
            owner: "alice".to_string(),
            balance: 1,
            version: 1,
        };
        memory.insert_row("accounts", Account::schema().dehydrate(&account).unwrap());

        let mut manager = ItemManager::new(memory);
        let keys = KeyMap::from([("id".to_string(), AttributeValue::S("a1".to_string()))]);
        let via_manager = manager.get::<Account>(&keys, false).await.unwrap().unwrap();
        let via_repository = manager
            .repository::<Account>()
            .get(&keys, false)
            .await
            .unwrap()
            .unwrap();
        assert!(std::sync::Arc::ptr_eq(&via_manager, &via_repository));
    }
}
