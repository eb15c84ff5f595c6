//! Integration tests for tables, indices and caches sharing one store
//!
//! Every scenario runs against `MemoryStore` and checks that records and the
//! index entries their hooks maintain commit and abort together.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use tessera_core::{Error, Namespace, Record};
use tessera_primitives::{
    CacheOptions, CacheStore, IdAllocator, IdGenerator, ManyToOne, ManyToOneOptions,
    SecondaryIndex, Table, UniqueIndex, UniqueIndexOptions,
};
use tessera_storage::{MemoryStore, Store};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Author {
    id: u64,
    email: String,
    country: String,
}

impl Record for Author {
    fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Post {
    id: u64,
    author_id: u64,
    title: String,
}

impl Record for Post {
    fn id(&self) -> u64 {
        self.id
    }
}

fn author(id: u64, email: &str, country: &str) -> Author {
    Author {
        id,
        email: email.into(),
        country: country.into(),
    }
}

fn post(id: u64, author_id: u64, title: &str) -> Post {
    Post {
        id,
        author_id,
        title: title.into(),
    }
}

struct Schema {
    authors: Table<Author>,
    posts: Table<Post>,
    by_email: UniqueIndex<Author, String>,
    by_country: SecondaryIndex<Author, String>,
    posts_by_author: ManyToOne<Post, Author>,
}

fn schema() -> Schema {
    let authors = Table::new(Namespace::new(20));
    let posts = Table::new(Namespace::new(21));
    let by_email = UniqueIndex::new(Namespace::new(22), &authors, |a: &Author| a.email.clone());
    let by_country =
        SecondaryIndex::new(Namespace::new(23), &authors, |a: &Author| a.country.clone());
    let posts_by_author = ManyToOne::new(
        Namespace::new(24),
        &posts,
        &authors,
        |p: &Post| p.author_id,
        ManyToOneOptions::default().cascade_delete(),
    );
    Schema {
        authors,
        posts,
        by_email,
        by_country,
        posts_by_author,
    }
}

// ============================================================================
// Unique index
// ============================================================================

mod unique {
    use super::*;

    #[test]
    fn test_lookup_by_unique_key() {
        let s = schema();
        let store = MemoryStore::new();
        store
            .update(|tx| s.authors.insert(tx, author(1, "ann@x", "fi")))
            .unwrap();

        let found = store.view(|tx| s.by_email.get(tx, "ann@x")).unwrap();
        assert_eq!(found.id, 1);
        assert!(store
            .view(|tx| s.by_email.get(tx, "nobody@x"))
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_duplicate_key_aborts_transaction() {
        let s = schema();
        let store = MemoryStore::new();
        store
            .update(|tx| s.authors.insert(tx, author(1, "ann@x", "fi")))
            .unwrap();

        let err = store
            .update(|tx| {
                s.authors.insert(tx, author(2, "bob@x", "se"))?;
                s.authors.insert(tx, author(3, "ann@x", "se"))
            })
            .unwrap_err();
        assert!(matches!(err, Error::UniqueConstraintViolated { .. }));
        assert!(err.is_write_conflict());

        // Author 2 was written in the aborted transaction
        assert!(store.view(|tx| s.authors.try_get(tx, 2)).unwrap().is_none());
        assert!(store.view(|tx| s.by_email.get_id(tx, "bob@x")).is_err());
    }

    #[test]
    fn test_rekey_frees_old_key() {
        let s = schema();
        let store = MemoryStore::new();
        store
            .update(|tx| s.authors.insert(tx, author(1, "ann@x", "fi")))
            .unwrap();
        store
            .update(|tx| {
                s.authors.transform(tx, 1, |a| {
                    a.email = "anne@x".into();
                    Ok(())
                })
            })
            .unwrap();
        store
            .update(|tx| s.authors.insert(tx, author(2, "ann@x", "fi")))
            .unwrap();

        let ids = store
            .view(|tx| s.by_email.get_many_ids(tx, &["anne@x", "ann@x"]))
            .unwrap();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_resolver_replaces_conflicting_record() {
        let authors: Table<Author> = Table::new(Namespace::new(30));
        let by_email = UniqueIndex::with_options(
            Namespace::new(31),
            &authors,
            |a: &Author| a.email.clone(),
            UniqueIndexOptions::<Author>::default().on_conflict(|tx, table, _new, old| {
                table.delete(tx, old.id).map(|_| ())
            }),
        );
        let store = MemoryStore::new();
        store
            .update(|tx| authors.insert(tx, author(1, "ann@x", "fi")))
            .unwrap();
        store
            .update(|tx| authors.insert(tx, author(2, "ann@x", "se")))
            .unwrap();

        assert_eq!(store.view(|tx| by_email.get_id(tx, "ann@x")).unwrap(), 2);
        assert!(store.view(|tx| authors.try_get(tx, 1)).unwrap().is_none());
    }

    #[test]
    fn test_delete_by_keys_is_all_or_nothing() {
        let s = schema();
        let store = MemoryStore::new();
        store
            .update(|tx| {
                s.authors.insert(tx, author(1, "a@x", "fi"))?;
                s.authors.insert(tx, author(2, "b@x", "fi"))
            })
            .unwrap();

        assert!(store
            .update(|tx| s.by_email.delete(tx, &["a@x", "missing@x"]))
            .is_err());
        assert_eq!(store.view(|tx| s.authors.get_all(tx)).unwrap().len(), 2);

        let deleted = store
            .update(|tx| s.by_email.delete(tx, &["a@x", "b@x"]))
            .unwrap();
        assert_eq!(deleted, vec![1, 2]);
        assert!(store.view(|tx| s.authors.get_all(tx)).unwrap().is_empty());
    }
}

// ============================================================================
// Secondary index
// ============================================================================

mod secondary {
    use super::*;

    #[test]
    fn test_index_follows_updates_and_deletes() {
        let s = schema();
        let store = MemoryStore::new();
        store
            .update(|tx| {
                s.authors.insert(tx, author(1, "a@x", "fi"))?;
                s.authors.insert(tx, author(2, "b@x", "fi"))?;
                s.authors.insert(tx, author(3, "c@x", "se"))
            })
            .unwrap();
        assert_eq!(store.view(|tx| s.by_country.count(tx, "fi")).unwrap(), 2);

        store
            .update(|tx| {
                s.authors.transform(tx, 2, |a| {
                    a.country = "se".into();
                    Ok(())
                })
            })
            .unwrap();
        store.update(|tx| s.authors.delete(tx, 3)).unwrap();

        let fi = store.view(|tx| s.by_country.get_all_ids(tx, "fi")).unwrap();
        let se = store.view(|tx| s.by_country.get_all_ids(tx, "se")).unwrap();
        assert_eq!(fi, vec![1]);
        assert_eq!(se, vec![2]);
    }

    #[test]
    fn test_salted_store_hashes_differently() {
        let s = schema();
        let plain = MemoryStore::new();
        let salted = MemoryStore::with_salt(vec![7u8; 80]);
        for store in [&plain, &salted] {
            store
                .update(|tx| s.authors.insert(tx, author(1, "a@x", "fi")))
                .unwrap();
            assert_eq!(store.view(|tx| s.by_country.get_all_ids(tx, "fi")).unwrap(), vec![1]);
        }
        let plain_keys: Vec<_> = plain.snapshot("23:").into_keys().collect();
        let salted_keys: Vec<_> = salted.snapshot("23:").into_keys().collect();
        assert_eq!(plain_keys.len(), 1);
        assert_ne!(plain_keys, salted_keys);
    }
}

// ============================================================================
// Many-to-one
// ============================================================================

mod many_to_one {
    use super::*;

    #[test]
    fn test_children_by_parent() {
        let s = schema();
        let store = MemoryStore::new();
        store
            .update(|tx| {
                let a = s.authors.insert(tx, author(1, "a@x", "fi"))?;
                s.posts.insert(tx, post(10, a.id, "one"))?;
                s.posts.insert(tx, post(11, a.id, "two"))?;
                s.posts.insert(tx, post(12, 99, "orphan"))
            })
            .unwrap();

        let a = store.view(|tx| s.authors.get(tx, 1)).unwrap();
        let mut titles: Vec<String> = store
            .view(|tx| s.posts_by_author.get_all_by_ref(tx, &a))
            .unwrap()
            .into_iter()
            .map(|p| p.title)
            .collect();
        titles.sort();
        assert_eq!(titles, vec!["one", "two"]);

        let p = store.view(|tx| s.posts.get(tx, 11)).unwrap();
        assert_eq!(store.view(|tx| s.posts_by_author.get_ref(tx, &p)).unwrap(), a);
    }

    #[test]
    fn test_cascade_delete() {
        let s = schema();
        let store = MemoryStore::new();
        store
            .update(|tx| {
                s.authors.insert(tx, author(1, "a@x", "fi"))?;
                s.authors.insert(tx, author(2, "b@x", "fi"))?;
                s.posts.insert(tx, post(10, 1, "one"))?;
                s.posts.insert(tx, post(11, 1, "two"))?;
                s.posts.insert(tx, post(12, 2, "three"))
            })
            .unwrap();

        store.update(|tx| s.authors.delete(tx, 1)).unwrap();

        let remaining: Vec<u64> = store
            .view(|tx| s.posts.get_all(tx))
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(remaining, vec![12]);
        assert!(store
            .view(|tx| s.posts_by_author.get_all_ids_by_ref_id(tx, 1))
            .unwrap()
            .is_empty());
        // The unique key of the deleted author is free again
        assert!(store.view(|tx| s.by_email.get_id(tx, "a@x")).is_err());
    }
}

// ============================================================================
// Cache + id allocation over the same schema
// ============================================================================

mod cached {
    use super::*;

    #[test]
    fn test_get_or_insert_by_unique_key() {
        let s = schema();
        let store = Arc::new(MemoryStore::new());
        let ids = IdAllocator::new(Arc::clone(&store), 10);
        let cache = CacheStore::new(Arc::clone(&store), s.authors.clone(), CacheOptions::default());
        let by_email = {
            let index = s.by_email.clone();
            cache.register_index(
                |a: &Author| a.email.clone(),
                move |tx, email: &String| index.get(tx, email.as_str()),
            )
        };

        let first = by_email
            .get_or_insert(&"ann@x".to_string(), || {
                Ok(author(ids.generate_id()?, "ann@x", "fi"))
            })
            .unwrap();
        let again = by_email
            .get_or_insert(&"ann@x".to_string(), || {
                Ok(author(ids.generate_id()?, "ann@x", "fi"))
            })
            .unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(store.view(|tx| s.authors.get_all(tx)).unwrap().len(), 1);

        // A fresh cache must load through the unique index
        let cold = CacheStore::new(Arc::clone(&store), s.authors.clone(), CacheOptions::default());
        let index = s.by_email.clone();
        let cold_by_email = cold.register_index(
            |a: &Author| a.email.clone(),
            move |tx, email: &String| index.get(tx, email.as_str()),
        );
        assert_eq!(cold_by_email.get(&"ann@x".to_string()).unwrap().id, first.id);
        assert_eq!(cold.stats().misses, 1);
    }

    #[test]
    fn test_get_or_insert_by_id_returns_unique_violation() {
        let s = schema();
        let store = Arc::new(MemoryStore::new());
        let cache = CacheStore::new(Arc::clone(&store), s.authors.clone(), CacheOptions::default());
        cache.insert(author(1, "ann@x", "fi")).unwrap();

        let mut calls = 0;
        let err = cache
            .get_or_insert(2, || {
                calls += 1;
                Ok(author(2, "ann@x", "se"))
            })
            .unwrap_err();
        assert!(err.is_unique_violation());
        assert_eq!(calls, 1);
        assert!(store.view(|tx| s.authors.try_get(tx, 2)).unwrap().is_none());
    }

    #[test]
    fn test_get_or_insert_by_key_gives_up_on_foreign_violation() {
        let s = schema();
        let store = Arc::new(MemoryStore::new());
        let cache = CacheStore::new(Arc::clone(&store), s.authors.clone(), CacheOptions::default());
        let by_email = {
            let index = s.by_email.clone();
            cache.register_index(
                |a: &Author| a.email.clone(),
                move |tx, email: &String| index.get(tx, email.as_str()),
            )
        };
        cache.insert(author(1, "ann@x", "fi")).unwrap();

        // The built record collides on a key other than the one looked up
        let mut calls = 0;
        let err = by_email
            .get_or_insert(&"zed@x".to_string(), || {
                calls += 1;
                Ok(author(3, "ann@x", "se"))
            })
            .unwrap_err();
        assert!(err.is_unique_violation());
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_get_or_insert_by_key_returns_racing_winner() {
        let s = schema();
        let store = Arc::new(MemoryStore::new());
        let cache = CacheStore::new(Arc::clone(&store), s.authors.clone(), CacheOptions::default());
        let by_email = {
            let index = s.by_email.clone();
            cache.register_index(
                |a: &Author| a.email.clone(),
                move |tx, email: &String| index.get(tx, email.as_str()),
            )
        };

        let mut calls = 0;
        let got = by_email
            .get_or_insert(&"ann@x".to_string(), || {
                calls += 1;
                // Another writer commits the same email first
                store.update(|tx| s.authors.insert(tx, author(1, "ann@x", "fi")))?;
                Ok(author(2, "ann@x", "se"))
            })
            .unwrap();
        assert_eq!(got.id, 1);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_expired_item_reloads_latest_value() {
        let s = schema();
        let store = Arc::new(MemoryStore::new());
        let cache = CacheStore::new(
            Arc::clone(&store),
            s.authors.clone(),
            CacheOptions {
                ttl: Duration::from_millis(20),
                gc_interval: Duration::from_millis(10),
                capacity: None,
            },
        );
        cache.insert(author(1, "a@x", "fi")).unwrap();

        // Written behind the cache's back
        store
            .update(|tx| {
                s.authors.transform(tx, 1, |a| {
                    a.country = "se".into();
                    Ok(())
                })
            })
            .unwrap();
        assert_eq!(cache.get(1).unwrap().country, "fi");

        cache.gc();
        cache.gc();
        cache.gc();
        assert_eq!(cache.get(1).unwrap().country, "se");
    }
}

// ============================================================================
// Table model check
// ============================================================================

#[derive(Debug, Clone)]
enum Op {
    Insert(u64, String),
    Upsert(u64, String),
    Delete(u64),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u64..8, "[a-c]{1,2}").prop_map(|(id, e)| Op::Insert(id, e)),
        (0u64..8, "[a-c]{1,2}").prop_map(|(id, e)| Op::Upsert(id, e)),
        (0u64..8).prop_map(Op::Delete),
    ]
}

proptest! {
    #[test]
    fn prop_table_and_unique_index_match_model(ops in prop::collection::vec(arb_op(), 1..40)) {
        let s = schema();
        let store = MemoryStore::new();
        let mut model: BTreeMap<u64, String> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Insert(id, email) => {
                    let owner = model.iter().find(|(_, e)| **e == email).map(|(i, _)| *i);
                    let r = store.update(|tx| s.authors.insert(tx, author(id, &email, "fi")));
                    if model.contains_key(&id) || owner.is_some() {
                        prop_assert!(r.is_err());
                    } else {
                        prop_assert!(r.is_ok());
                        model.insert(id, email);
                    }
                }
                Op::Upsert(id, email) => {
                    let owner = model.iter().find(|(_, e)| **e == email).map(|(i, _)| *i);
                    let r = store.update(|tx| s.authors.upsert(tx, author(id, &email, "fi")));
                    if owner.map_or(false, |o| o != id) {
                        prop_assert!(r.is_err());
                    } else {
                        prop_assert!(r.is_ok());
                        model.insert(id, email);
                    }
                }
                Op::Delete(id) => {
                    let r = store.update(|tx| s.authors.delete(tx, id));
                    prop_assert_eq!(r.is_ok(), model.remove(&id).is_some());
                }
            }
        }

        let stored: BTreeMap<u64, String> = store
            .view(|tx| s.authors.get_all(tx))
            .unwrap()
            .into_iter()
            .map(|a| (a.id, a.email))
            .collect();
        prop_assert_eq!(&stored, &model);
        for (id, email) in &model {
            prop_assert_eq!(store.view(|tx| s.by_email.get_id(tx, email.as_str())).unwrap(), *id);
        }
    }
}
