use std::sync::Arc;

use futures::Stream;
use tokio::sync::watch;

/// Full contents of a store at one point in time.
pub type Snapshot<T> = Arc<Vec<T>>;

type RowFilter<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Publishing side of a store's snapshots. Owned by the store; publication
/// replaces the current value and never waits on subscribers.
#[derive(Debug)]
pub(crate) struct FeedPublisher<T> {
    tx: watch::Sender<Snapshot<T>>,
}

impl<T> FeedPublisher<T> {
    pub(crate) fn new(initial: Vec<T>) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self { tx }
    }

    pub(crate) fn publish(&self, snapshot: Vec<T>) {
        self.tx.send_replace(Arc::new(snapshot));
    }

    pub(crate) fn modify(&self, update: impl FnOnce(&mut Vec<T>))
    where
        T: Clone,
    {
        self.tx.send_modify(|snapshot| update(Arc::make_mut(snapshot)));
    }

    pub(crate) fn current(&self) -> Snapshot<T> {
        self.tx.borrow().clone()
    }

    pub(crate) fn subscribe(&self, filter: Option<RowFilter<T>>) -> ChangeFeed<T> {
        ChangeFeed {
            rx: self.tx.subscribe(),
            filter,
            initial_pending: true,
            last_delivered: None,
        }
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Live view over a store query.
///
/// The first [`ChangeFeed::next`] resolves immediately with the current
/// contents; each later call waits for a mutation that changes the result.
/// Subscribers that fall behind skip intermediate snapshots, but never receive
/// an older snapshot after a newer one.
///
/// Unfiltered feeds hand out the store's own snapshot. Holding one across a
/// write makes that write copy the rows, so drop snapshots once read.
pub struct ChangeFeed<T> {
    rx: watch::Receiver<Snapshot<T>>,
    filter: Option<RowFilter<T>>,
    initial_pending: bool,
    last_delivered: Option<Snapshot<T>>,
}

impl<T> std::fmt::Debug for ChangeFeed<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeed")
            .field("filtered", &self.filter.is_some())
            .field("initial_pending", &self.initial_pending)
            .finish()
    }
}

impl<T> ChangeFeed<T>
where
    T: Clone + PartialEq,
{
    /// Current query result without waiting or consuming a change.
    pub fn snapshot(&self) -> Snapshot<T> {
        select_rows(&self.filter, &self.rx.borrow())
    }

    /// Next snapshot for this subscriber. Returns `None` once the store has
    /// been dropped.
    pub async fn next(&mut self) -> Option<Snapshot<T>> {
        if self.initial_pending {
            self.initial_pending = false;
            let view = select_rows(&self.filter, &self.rx.borrow_and_update());
            return Some(self.remember(view));
        }

        loop {
            self.rx.changed().await.ok()?;
            let view = select_rows(&self.filter, &self.rx.borrow_and_update());
            if self.filter.is_some() && self.last_delivered.as_deref() == Some(&*view) {
                continue;
            }
            return Some(self.remember(view));
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Snapshot<T>> {
        futures::stream::unfold(self, |mut feed| async move {
            feed.next().await.map(|snapshot| (snapshot, feed))
        })
    }

    fn remember(&mut self, view: Snapshot<T>) -> Snapshot<T> {
        // Unfiltered feeds deliver every mutation; only filtered ones need
        // the last view to suppress unrelated changes.
        if self.filter.is_some() {
            self.last_delivered = Some(view.clone());
        }
        view
    }
}

// Runs while the watch value is borrowed, so filtered feeds copy only the
// matching rows and never keep the store's snapshot alive.
fn select_rows<T: Clone>(filter: &Option<RowFilter<T>>, current: &Snapshot<T>) -> Snapshot<T> {
    match filter {
        Some(keep) => Arc::new(current.iter().filter(|row| keep(row)).cloned().collect()),
        None => Arc::clone(current),
    }
}

pub(crate) fn row_filter<T>(keep: impl Fn(&T) -> bool + Send + Sync + 'static) -> RowFilter<T> {
    Arc::new(keep)
}
