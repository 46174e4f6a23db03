//! Connection-gated pagination for list screens.
//!
//! A [`SessionPresenter`] owns one item list and its cursor. Requests are only
//! released while the session is connected, and a reconnect throws away items
//! fetched against the previous connection.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Notify, watch};
use tracing::debug;

use crate::types::Connection;

/// Page window sent to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub limit: usize,
    pub offset: usize,
}

impl Pagination {
    pub fn first_page(limit: usize) -> Self {
        Self { limit, offset: 0 }
    }
}

/// Where the next page starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    Page(Pagination),
    /// The service returned a short page; there is nothing more to load.
    Exhausted,
}

/// One page fetch released by a [`RequestStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub pagination: Pagination,
    /// Reset counter at issue time. Results for an older generation are dropped.
    pub generation: u64,
}

#[derive(Debug)]
struct PresenterState<T> {
    initial: Pagination,
    cursor: Cursor,
    items: Vec<T>,
    generation: u64,
    pending: Option<Pagination>,
    in_flight: Option<PageRequest>,
    was_active: bool,
    connection_id: Option<String>,
}

impl<T> PresenterState<T> {
    fn new() -> Self {
        Self {
            initial: Pagination::first_page(0),
            cursor: Cursor::Page(Pagination::first_page(0)),
            items: Vec::new(),
            generation: 0,
            pending: None,
            in_flight: None,
            was_active: false,
            connection_id: None,
        }
    }

    fn restart(&mut self) {
        self.items.clear();
        self.cursor = Cursor::Page(self.initial);
        self.generation += 1;
        self.in_flight = None;
        self.pending = Some(self.initial);
    }

    fn observe(&mut self, connection: &Connection) {
        let active = connection.is_connected_or_connecting();
        let connection_id = connection.connection_id().map(str::to_owned);

        let resumed = !self.was_active && active;
        let replaced = matches!(
            (&self.connection_id, &connection_id),
            (Some(previous), Some(current)) if previous != current
        );
        if (resumed || replaced) && !self.items.is_empty() {
            debug!(
                dropped = self.items.len(),
                "session resumed; restarting pagination"
            );
            self.restart();
        }

        self.was_active = active;
        if connection_id.is_some() || !active {
            self.connection_id = connection_id;
        }
    }

    fn poll(&mut self, connection: &Connection) -> Option<PageRequest> {
        self.observe(connection);
        if !connection.is_connected() {
            return None;
        }
        let pagination = self.pending.take()?;
        let request = PageRequest {
            pagination,
            generation: self.generation,
        };
        self.in_flight = Some(request);
        Some(request)
    }
}

fn lock<T>(state: &Mutex<T>) -> MutexGuard<'_, T> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Paginated list driven by the shared connection stream.
///
/// Each presenter owns its own items and cursor. Clones share them.
#[derive(Debug)]
pub struct SessionPresenter<T> {
    state: Arc<Mutex<PresenterState<T>>>,
    wake: Arc<Notify>,
    connection: watch::Receiver<Connection>,
}

impl<T> Clone for SessionPresenter<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            wake: Arc::clone(&self.wake),
            connection: self.connection.clone(),
        }
    }
}

impl<T> SessionPresenter<T> {
    pub fn new(connection: watch::Receiver<Connection>) -> Self {
        Self {
            state: Arc::new(Mutex::new(PresenterState::new())),
            wake: Arc::new(Notify::new()),
            connection,
        }
    }

    /// Start (or restart) the request sequence at `initial`.
    ///
    /// The returned stream yields the initial page as soon as the session is
    /// connected, then one request per [`load_next`](Self::load_next).
    pub fn prepare_request_stream(&self, initial: Pagination) -> RequestStream<T> {
        {
            let mut state = self.synced();
            state.initial = initial;
            state.restart();
        }
        self.wake.notify_one();
        RequestStream {
            state: Arc::clone(&self.state),
            wake: Arc::clone(&self.wake),
            connection: self.connection.clone(),
        }
    }

    /// Drop all items and request the initial page again.
    pub fn reload(&self) {
        self.synced().restart();
        self.wake.notify_one();
    }

    /// Request the page after the last applied one.
    ///
    /// Returns `false` without queuing anything when the cursor is exhausted or
    /// a request is already queued or in flight.
    pub fn load_next(&self) -> bool {
        let mut state = self.synced();
        if state.pending.is_some() || state.in_flight.is_some() {
            return false;
        }
        let Cursor::Page(next) = state.cursor else {
            return false;
        };
        state.pending = Some(next);
        drop(state);
        self.wake.notify_one();
        true
    }

    /// Store the result of `request`.
    ///
    /// Returns `false` and discards the items when the request is no longer
    /// in flight, either because it was already applied or because the list
    /// has been reset since. An empty page ends the list.
    pub fn apply_page(&self, request: PageRequest, page: Vec<T>) -> bool {
        let mut state = self.synced();
        if request.generation != state.generation {
            debug!(
                stale = request.generation,
                current = state.generation,
                "discarding page from previous session"
            );
            return false;
        }
        if state.in_flight != Some(request) {
            debug!(offset = request.pagination.offset, "discarding page not in flight");
            return false;
        }
        state.in_flight = None;

        let received = page.len();
        state.items.extend(page);
        state.cursor = if received == 0 || received < request.pagination.limit {
            Cursor::Exhausted
        } else {
            Cursor::Page(Pagination {
                limit: request.pagination.limit,
                offset: request.pagination.offset + received,
            })
        };
        true
    }

    /// Queue `request` again after the fetch failed.
    pub fn page_failed(&self, request: PageRequest) {
        let mut state = self.synced();
        if state.in_flight != Some(request) {
            return;
        }
        state.in_flight = None;
        state.pending = Some(request.pagination);
        drop(state);
        self.wake.notify_one();
    }

    pub fn next_cursor(&self) -> Cursor {
        self.synced().cursor
    }

    pub fn items(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.synced().items.clone()
    }

    fn synced(&self) -> MutexGuard<'_, PresenterState<T>> {
        let connection = self.connection.borrow().clone();
        let mut state = lock(&self.state);
        state.observe(&connection);
        state
    }
}

/// Lazy sequence of page requests gated on `Connection::Connected`.
#[derive(Debug)]
pub struct RequestStream<T> {
    state: Arc<Mutex<PresenterState<T>>>,
    wake: Arc<Notify>,
    connection: watch::Receiver<Connection>,
}

impl<T> RequestStream<T> {
    /// Wait for the next request the session is allowed to send.
    ///
    /// Returns `None` once the connection stream has closed.
    pub async fn next(&mut self) -> Option<PageRequest> {
        loop {
            let connection = self.connection.borrow_and_update().clone();
            let request = lock(&self.state).poll(&connection);
            if request.is_some() {
                return request;
            }

            tokio::select! {
                changed = self.connection.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                () = self.wake.notified() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::types::User;

    fn connected(connection_id: &str) -> Connection {
        Connection::Connected {
            connection_id: connection_id.into(),
            user: User::new("alice"),
        }
    }

    async fn next_request(stream: &mut RequestStream<&'static str>) -> PageRequest {
        timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("request should be released")
            .expect("connection stream should be open")
    }

    #[tokio::test(start_paused = true)]
    async fn holds_requests_until_connected() {
        let (tx, rx) = watch::channel(Connection::Connecting);
        let presenter = SessionPresenter::<&str>::new(rx);
        let mut stream = presenter.prepare_request_stream(Pagination::first_page(3));

        assert!(
            timeout(Duration::from_secs(5), stream.next())
                .await
                .is_err()
        );

        tx.send_replace(connected("conn-1"));
        let request = next_request(&mut stream).await;
        assert_eq!(request.pagination, Pagination::first_page(3));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_resets_items_and_cursor() {
        let (tx, rx) = watch::channel(connected("conn-1"));
        let presenter = SessionPresenter::new(rx);
        let mut stream = presenter.prepare_request_stream(Pagination::first_page(3));

        let first = next_request(&mut stream).await;
        assert!(presenter.apply_page(first, vec!["A", "B", "C"]));
        assert_eq!(
            presenter.next_cursor(),
            Cursor::Page(Pagination {
                limit: 3,
                offset: 3
            })
        );

        tx.send_replace(Connection::NotConnected);
        tx.send_replace(Connection::Connecting);
        tx.send_replace(connected("conn-2"));

        let request = next_request(&mut stream).await;
        assert_eq!(request.pagination, Pagination::first_page(3));
        assert!(presenter.items().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn same_connection_id_after_observed_drop_still_resets() {
        let (tx, rx) = watch::channel(connected("conn-1"));
        let presenter = SessionPresenter::new(rx);
        let mut stream = presenter.prepare_request_stream(Pagination::first_page(2));
        let first = next_request(&mut stream).await;
        presenter.apply_page(first, vec!["A", "B"]);

        tx.send_replace(Connection::NotConnected);
        assert_eq!(presenter.items(), vec!["A", "B"]);
        tx.send_replace(connected("conn-1"));
        assert!(presenter.items().is_empty());
        assert_eq!(
            next_request(&mut stream).await.pagination,
            Pagination::first_page(2)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pages_from_before_a_reset_are_discarded() {
        let (_tx, rx) = watch::channel(connected("conn-1"));
        let presenter = SessionPresenter::new(rx);
        let mut stream = presenter.prepare_request_stream(Pagination::first_page(2));
        let stale = next_request(&mut stream).await;

        presenter.reload();
        assert!(!presenter.apply_page(stale, vec!["old", "old"]));

        let fresh = next_request(&mut stream).await;
        assert!(presenter.apply_page(fresh, vec!["new", "new"]));
        assert_eq!(presenter.items(), vec!["new", "new"]);
    }

    #[tokio::test(start_paused = true)]
    async fn short_page_exhausts_cursor() {
        let (_tx, rx) = watch::channel(connected("conn-1"));
        let presenter = SessionPresenter::new(rx);
        let mut stream = presenter.prepare_request_stream(Pagination::first_page(2));

        let first = next_request(&mut stream).await;
        presenter.apply_page(first, vec!["A", "B"]);
        assert!(presenter.load_next());
        let second = next_request(&mut stream).await;
        assert_eq!(second.pagination.offset, 2);

        presenter.apply_page(second, vec!["C"]);
        assert_eq!(presenter.next_cursor(), Cursor::Exhausted);
        assert!(!presenter.load_next());
        assert_eq!(presenter.items(), vec!["A", "B", "C"]);
    }

    #[tokio::test(start_paused = true)]
    async fn applying_same_page_twice_is_ignored() {
        let (_tx, rx) = watch::channel(connected("conn-1"));
        let presenter = SessionPresenter::new(rx);
        let mut stream = presenter.prepare_request_stream(Pagination::first_page(2));

        let first = next_request(&mut stream).await;
        assert!(presenter.apply_page(first, vec!["A", "B"]));
        assert!(!presenter.apply_page(first, vec!["A", "B"]));

        assert_eq!(presenter.items(), vec!["A", "B"]);
        assert_eq!(
            presenter.next_cursor(),
            Cursor::Page(Pagination {
                limit: 2,
                offset: 2
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn empty_page_exhausts_zero_limit_list() {
        let (_tx, rx) = watch::channel(connected("conn-1"));
        let presenter = SessionPresenter::<&str>::new(rx);
        let mut stream = presenter.prepare_request_stream(Pagination::first_page(0));

        let first = next_request(&mut stream).await;
        assert!(presenter.apply_page(first, Vec::new()));
        assert_eq!(presenter.next_cursor(), Cursor::Exhausted);
        assert!(!presenter.load_next());
    }

    #[tokio::test(start_paused = true)]
    async fn load_next_is_ignored_while_a_request_is_in_flight() {
        let (_tx, rx) = watch::channel(connected("conn-1"));
        let presenter = SessionPresenter::<&str>::new(rx);
        let mut stream = presenter.prepare_request_stream(Pagination::first_page(2));
        let first = next_request(&mut stream).await;

        assert!(!presenter.load_next());
        presenter.page_failed(first);
        assert_eq!(next_request(&mut stream).await, first);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_list_is_not_reset_on_reconnect() {
        let (tx, rx) = watch::channel(connected("conn-1"));
        let presenter = SessionPresenter::<&str>::new(rx);
        let mut stream = presenter.prepare_request_stream(Pagination::first_page(2));
        let first = next_request(&mut stream).await;

        tx.send_replace(Connection::NotConnected);
        presenter.next_cursor();
        tx.send_replace(connected("conn-2"));

        // nothing was loaded, so the in-flight request is still current
        assert!(presenter.apply_page(first, vec!["A", "B"]));
    }
}
