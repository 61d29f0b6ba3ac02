//! Date-window chunking and cursor pagination.

use std::future::Future;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Split `[start, end)` into consecutive windows no wider than `span`.
///
/// Each window starts where the previous one ended and the last is clipped to `end`.
/// An empty range or a non-positive span yields no windows.
pub fn date_windows(start: DateTime<Utc>, end: DateTime<Utc>, span: Duration) -> Vec<DateWindow> {
    let mut windows = Vec::new();
    if start >= end || span <= Duration::zero() {
        return windows;
    }

    let mut cursor = start;
    while cursor < end {
        let window_end = cursor
            .checked_add_signed(span)
            .map_or(end, |candidate| candidate.min(end));
        windows.push(DateWindow {
            start: cursor,
            end: window_end,
        });
        cursor = window_end;
    }
    windows
}

/// Fetch every window of `[start, end)` in order and concatenate the results.
///
/// The first error aborts the remaining windows.
pub async fn fetch_range<T, E, F, Fut>(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    span: Duration,
    mut fetch: F,
) -> Result<Vec<T>, E>
where
    F: FnMut(DateWindow) -> Fut,
    Fut: Future<Output = Result<Vec<T>, E>>,
{
    let mut items = Vec::new();
    for window in date_windows(start, end, span) {
        debug!(start = %window.start, end = %window.end, "fetching window");
        items.extend(fetch(window).await?);
    }
    Ok(items)
}

/// One page of results plus the cursor for the next page, if any.
#[derive(Debug, Clone)]
pub struct Page<T, C> {
    pub items: Vec<T>,
    pub next: Option<C>,
}

/// Follow a provider cursor until it reports no further results.
///
/// Stops early on an empty page or when the provider hands back the cursor it was given.
pub async fn fetch_pages<T, C, E, F, Fut>(mut fetch: F) -> Result<Vec<T>, E>
where
    C: Clone + PartialEq + std::fmt::Debug,
    F: FnMut(Option<C>) -> Fut,
    Fut: Future<Output = Result<Page<T, C>, E>>,
{
    let mut items = Vec::new();
    let mut cursor: Option<C> = None;
    loop {
        let page = fetch(cursor.clone()).await?;
        let empty = page.items.is_empty();
        items.extend(page.items);

        match page.next {
            Some(next) if !empty => {
                if cursor.as_ref() == Some(&next) {
                    warn!(?next, "provider repeated its cursor, stopping pagination");
                    break;
                }
                cursor = Some(next);
            }
            _ => break,
        }
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::cell::RefCell;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn twenty_five_days_with_ten_day_cap_is_three_windows() {
        let windows = date_windows(day(1), day(26), Duration::days(10));
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0].start, day(1));
        assert_eq!(windows[2].end, day(26));
        for pair in windows.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert_eq!(windows[2].end - windows[2].start, Duration::days(5));
    }

    #[test]
    fn degenerate_ranges_have_no_windows() {
        assert!(date_windows(day(5), day(5), Duration::days(1)).is_empty());
        assert!(date_windows(day(6), day(5), Duration::days(1)).is_empty());
        assert!(date_windows(day(1), day(5), Duration::zero()).is_empty());
    }

    #[tokio::test]
    async fn range_fetch_stops_at_first_error() {
        let seen = RefCell::new(Vec::new());
        let result: Result<Vec<u32>, String> =
            fetch_range(day(1), day(31), Duration::days(6), |window| {
                seen.borrow_mut().push(window);
                let n = seen.borrow().len();
                async move {
                    if n == 2 {
                        Err("boom".to_string())
                    } else {
                        Ok(vec![n as u32])
                    }
                }
            })
            .await;

        assert_eq!(result, Err("boom".to_string()));
        assert_eq!(seen.borrow().len(), 2);
    }

    #[tokio::test]
    async fn range_fetch_preserves_window_order() {
        let items: Result<Vec<DateTime<Utc>>, ()> =
            fetch_range(day(1), day(21), Duration::days(10), |window| async move {
                Ok(vec![window.start, window.end])
            })
            .await;
        assert_eq!(items.unwrap(), vec![day(1), day(11), day(11), day(21)]);
    }

    #[tokio::test]
    async fn pages_are_followed_until_cursor_runs_out() {
        let calls = RefCell::new(0);
        let items: Result<Vec<u32>, ()> = fetch_pages(|cursor: Option<u32>| {
            *calls.borrow_mut() += 1;
            async move {
                let page = cursor.unwrap_or(0);
                Ok(Page {
                    items: vec![page * 10, page * 10 + 1],
                    next: (page < 2).then_some(page + 1),
                })
            }
        })
        .await;

        assert_eq!(items.unwrap(), vec![0, 1, 10, 11, 20, 21]);
        assert_eq!(*calls.borrow(), 3);
    }

    #[tokio::test]
    async fn repeated_cursor_ends_pagination() {
        let calls = RefCell::new(0);
        let items: Result<Vec<u32>, ()> = fetch_pages(|_cursor: Option<&'static str>| {
            *calls.borrow_mut() += 1;
            async move {
                Ok(Page {
                    items: vec![1],
                    next: Some("same"),
                })
            }
        })
        .await;
        assert_eq!(items.unwrap(), vec![1, 1]);
        assert_eq!(*calls.borrow(), 2);
    }
}
