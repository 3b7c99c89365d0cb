use kube::Resource;
use kube::runtime::watcher::Event;
use std::collections::BTreeMap;

use crate::keys;

/// A change of a watched object, as seen by per-object handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum Change<T> {
    Add(T),
    Update(T, T),
    Delete(T),
    /// the initial list has been received
    Synced,
}

/// The last known version of each watched object.
///
/// Relists are diffed against the known objects, so handlers only see what actually changed.
pub struct Store<T> {
    objects: BTreeMap<keys::Object, T>,
    relist: Option<BTreeMap<keys::Object, T>>,
    synced: bool,
}

impl<T> Default for Store<T> {
    fn default() -> Self {
        Self {
            objects: BTreeMap::new(),
            relist: None,
            synced: false,
        }
    }
}

fn key_of<T: Resource>(v: &T) -> Option<keys::Object> {
    keys::Object::of(v.meta())
}

fn same_version<T: Resource>(a: &T, b: &T) -> bool {
    let (a, b) = (&a.meta().resource_version, &b.meta().resource_version);
    a.is_some() && a == b
}

impl<T: Resource + Clone> Store<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn ingest(&mut self, event: Event<T>) -> Vec<Change<T>> {
        use Event::*;
        match event {
            Init => {
                self.relist = Some(BTreeMap::new());
                vec![]
            }
            InitApply(v) => match self.relist.as_mut() {
                Some(relist) => {
                    if let Some(key) = key_of(&v) {
                        relist.insert(key, v);
                    }
                    vec![]
                }
                None => self.apply(v).into_iter().collect(),
            },
            InitDone => {
                let relist = self.relist.take().unwrap_or_default();
                let mut changes = self.replace(relist);
                if !self.synced {
                    self.synced = true;
                    changes.push(Change::Synced);
                }
                changes
            }
            Apply(v) => self.apply(v).into_iter().collect(),
            Delete(v) => {
                let Some(key) = key_of(&v) else {
                    return vec![];
                };
                let old = self.objects.remove(&key).unwrap_or(v);
                vec![Change::Delete(old)]
            }
        }
    }

    fn apply(&mut self, v: T) -> Option<Change<T>> {
        let key = key_of(&v)?;
        match self.objects.insert(key, v.clone()) {
            None => Some(Change::Add(v)),
            Some(old) if same_version(&old, &v) => None,
            Some(old) => Some(Change::Update(old, v)),
        }
    }

    fn replace(&mut self, objects: BTreeMap<keys::Object, T>) -> Vec<Change<T>> {
        let mut changes = Vec::new();

        for (key, old) in &self.objects {
            if !objects.contains_key(key) {
                changes.push(Change::Delete(old.clone()));
            }
        }

        for (key, v) in &objects {
            match self.objects.get(key) {
                None => changes.push(Change::Add(v.clone())),
                Some(old) if same_version(old, v) => {}
                Some(old) => changes.push(Change::Update(old.clone(), v.clone())),
            }
        }

        self.objects = objects;
        changes
    }
}
