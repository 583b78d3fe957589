//! Batching, bounded ordered concurrency and pagination.

use std::future::Future;

use futures::stream::{self, StreamExt};
use tracing::debug;

/// Hard ceiling on concurrent in-flight requests per source.
pub const MAX_WORKERS: usize = 4;

/// Split `items` into chunks of `size`, preserving input order.
pub fn batches<T: Clone>(items: &[T], size: usize) -> Vec<Vec<T>> {
    items.chunks(size.max(1)).map(|c| c.to_vec()).collect()
}

/// Run `f` over `items` with at most `workers` futures in flight.
///
/// Results come back in the order the items were issued, regardless of
/// completion order.
pub async fn fetch_ordered<T, R, F, Fut>(items: Vec<T>, workers: usize, f: F) -> Vec<R>
where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = R>,
{
    let workers = workers.clamp(1, MAX_WORKERS);
    stream::iter(items).map(f).buffered(workers).collect().await
}

/// One page of a paginated listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T, C> {
    pub items: Vec<T>,
    /// Cursor or URL of the next page; `None` ends pagination
    pub next: Option<C>,
}

/// Follow `next` cursors from `first` until exhausted or `max_pages` pages
/// have been fetched. A fetch error stops pagination and is returned.
pub async fn paginate<T, C, E, F, Fut>(first: C, max_pages: Option<usize>, mut fetch: F) -> Result<Vec<T>, E>
where
    F: FnMut(C) -> Fut,
    Fut: Future<Output = Result<Page<T, C>, E>>,
{
    let mut out = Vec::new();
    let mut cursor = Some(first);
    let mut pages = 0usize;

    while let Some(c) = cursor.take() {
        if max_pages.is_some_and(|max| pages >= max) {
            debug!(pages, "Page limit reached");
            break;
        }
        let page = fetch(c).await?;
        pages += 1;
        out.extend(page.items);
        cursor = page.next;
    }
    Ok(out)
}
