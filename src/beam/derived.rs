use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::door::{Cinema, Host, Init, ScreenWatcher};
use crate::shredder::Collector;

use super::Chain;

type Cast<S, T> = Box<dyn Fn(&S) -> T + Send + Sync>;
type Distinct<T> = Box<dyn Fn(&T, &T) -> bool + Send + Sync>;

struct Entry<T> {
    val: Arc<T>,
    updated: bool,
}

impl<T> Clone for Entry<T> {
    fn clone(&self) -> Self {
        Self {
            val: self.val.clone(),
            updated: self.updated,
        }
    }
}

/// Projection of a parent chain, cached per sequence.
pub(crate) struct Derived<S, T> {
    source: Arc<dyn Chain<S>>,
    cast: Cast<S, T>,
    distinct: Option<Distinct<T>>,
    values: Arc<Mutex<HashMap<u64, Entry<T>>>>,
}

impl<S, T> Derived<S, T>
where
    S: Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    pub(crate) fn new(source: Arc<dyn Chain<S>>, cast: Cast<S, T>, distinct: Option<Distinct<T>>) -> Self {
        Self {
            source,
            cast,
            distinct,
            values: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Entry<T>>> {
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn entry(&self, values: &HashMap<u64, Entry<T>>, seq: u64, collector: Option<&Collector>) -> Option<Entry<T>> {
        if let Some(c) = collector {
            let values = self.values.clone();
            c.add(move || {
                values
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .retain(|s, _| *s >= seq);
            });
        }
        let (src, updated) = self.source.sync(seq, collector)?;
        let prev = values.get(&seq.saturating_sub(1));
        if !updated {
            let val = match prev {
                Some(prev) => prev.val.clone(),
                None => Arc::new((self.cast)(&src)),
            };
            return Some(Entry { val, updated: false });
        }
        let val = Arc::new((self.cast)(&src));
        let Some(distinct) = &self.distinct else {
            return Some(Entry { val, updated: true });
        };
        let prev = match prev {
            Some(prev) => Some(prev.val.clone()),
            None => self
                .source
                .sync(seq.saturating_sub(1), None)
                .map(|(v, _)| Arc::new((self.cast)(&v))),
        };
        match prev {
            Some(prev) if !distinct(&val, &prev) => Some(Entry {
                val: prev,
                updated: false,
            }),
            _ => Some(Entry { val, updated: true }),
        }
    }
}

impl<S, T> Chain<T> for Derived<S, T>
where
    S: Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    fn sync(&self, seq: u64, collector: Option<&Collector>) -> Option<(Arc<T>, bool)> {
        let mut values = self.lock();
        if let Some(e) = values.get(&seq) {
            return Some((e.val.clone(), e.updated));
        }
        let entry = self.entry(&values, seq, collector)?;
        values.insert(seq, entry.clone());
        Some((entry.val, entry.updated))
    }

    fn watch(&self, host: &Arc<dyn Host>, cinema: &Cinema, w: Arc<dyn ScreenWatcher>) -> Option<Init> {
        self.source.watch(host, cinema, w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Chain over a fixed history; seq `n` holds `history[n - 1]`.
    struct History(Vec<i32>);

    impl Chain<i32> for History {
        fn sync(&self, seq: u64, _collector: Option<&Collector>) -> Option<(Arc<i32>, bool)> {
            let idx = usize::try_from(seq).ok()?.checked_sub(1)?;
            let v = *self.0.get(idx)?;
            Some((Arc::new(v), true))
        }

        fn watch(&self, _host: &Arc<dyn Host>, _cinema: &Cinema, _w: Arc<dyn ScreenWatcher>) -> Option<Init> {
            None
        }
    }

    fn parity(history: Vec<i32>) -> Derived<i32, i32> {
        Derived::new(
            Arc::new(History(history)),
            Box::new(|v: &i32| v.rem_euclid(2)),
            Some(Box::new(|new: &i32, old: &i32| new != old)),
        )
    }

    #[test]
    fn test_unchanged_projection_is_not_updated() {
        let d = parity(vec![1, 3, 4, 6, 7]);
        let got: Vec<_> = (1..=5)
            .map(|seq| {
                let (v, updated) = d.sync(seq, None).unwrap();
                (*v, updated)
            })
            .collect();
        assert_eq!(got, vec![(1, true), (1, false), (0, true), (0, false), (1, true)]);
        assert!(d.sync(6, None).is_none());
    }

    #[test]
    fn test_collector_prunes_older_entries() {
        let d = parity(vec![1, 2, 3]);
        d.sync(1, None).unwrap();
        d.sync(2, None).unwrap();
        let c = Collector::new();
        d.sync(3, Some(&c)).unwrap();
        assert_eq!(d.lock().len(), 3);
        c.apply();
        let mut left: Vec<_> = d.lock().keys().copied().collect();
        left.sort();
        assert_eq!(left, vec![3]);
    }

    #[test]
    fn test_unfiltered_always_updates() {
        let d: Derived<i32, i32> = Derived::new(Arc::new(History(vec![2, 4])), Box::new(|v: &i32| v % 2), None);
        assert_eq!(d.sync(2, None).map(|(v, u)| (*v, u)), Some((0, true)));
    }

    proptest! {
        #[test]
        fn prop_sync_is_idempotent_and_filtered(history in proptest::collection::vec(-20i32..20, 1..40)) {
            let d = parity(history.clone());
            let mut emitted: Option<i32> = None;
            for seq in 1..=history.len() as u64 {
                let first = d.sync(seq, None).map(|(v, u)| (*v, u));
                let again = d.sync(seq, None).map(|(v, u)| (*v, u));
                prop_assert_eq!(first, again);
                let (v, updated) = first.unwrap();
                prop_assert_eq!(updated, emitted != Some(v));
                emitted = Some(v);
            }
        }
    }
}
