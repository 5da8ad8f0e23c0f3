use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;

/// Runs `task` over `items` on at most `limit` scoped worker threads and
/// returns the results in input order. Each worker pulls the next unclaimed
/// index, so at most `limit` tasks are in flight at any time.
pub fn bounded_map<T, R, F>(items: &[T], limit: usize, task: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    let workers = limit.max(1).min(items.len());
    if workers <= 1 {
        return items.iter().map(&task).collect();
    }

    let next = AtomicUsize::new(0);
    let slots: Mutex<Vec<Option<R>>> = Mutex::new((0..items.len()).map(|_| None).collect());
    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let idx = next.fetch_add(1, Ordering::SeqCst);
                let Some(item) = items.get(idx) else {
                    break;
                };
                let result = task(item);
                if let Ok(mut slots) = slots.lock() {
                    slots[idx] = Some(result);
                }
            });
        }
    });

    slots
        .into_inner()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .into_iter()
        .flatten()
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::bounded_map;

    #[test]
    fn preserves_input_order() {
        let items: Vec<u64> = (0..20).collect();
        let out = bounded_map(&items, 4, |value| {
            thread::sleep(Duration::from_millis((20 - value) % 5));
            value * 10
        });
        assert_eq!(out, items.iter().map(|value| value * 10).collect::<Vec<_>>());
    }

    #[test]
    fn never_exceeds_the_limit() {
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let items: Vec<usize> = (0..16).collect();
        bounded_map(&items, 3, |_| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(5));
            active.fetch_sub(1, Ordering::SeqCst);
        });
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn empty_and_sequential_inputs() {
        let empty: Vec<u8> = Vec::new();
        assert!(bounded_map(&empty, 8, |value| *value).is_empty());
        assert_eq!(bounded_map(&[1, 2, 3], 0, |value| value + 1), vec![2, 3, 4]);
    }
}
