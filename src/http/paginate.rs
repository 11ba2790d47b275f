use crate::error::ConnectorError;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// One page-fetching strategy: cursor token, timestamp, or window.
#[async_trait]
pub trait PageFetcher: Send {
    type Cursor: Clone + PartialEq + Send + Sync + std::fmt::Debug;
    type Page: Send;

    async fn fetch(&mut self, cursor: Option<&Self::Cursor>) -> Result<Self::Page, ConnectorError>;

    /// Cursor for the page after `page`, or `None` when it was the last.
    fn next_cursor(&self, page: &Self::Page) -> Option<Self::Cursor>;
}

/// Lazy page sequence. Stops on an absent or unchanged cursor, on error,
/// or when the stop token fires. A cursor never repeats.
pub struct Paginator<F: PageFetcher> {
    fetcher: F,
    cursor: Option<F::Cursor>,
    done: bool,
    stop: CancellationToken,
}

impl<F: PageFetcher> Paginator<F> {
    pub fn new(fetcher: F, start: Option<F::Cursor>, stop: CancellationToken) -> Self {
        Self {
            fetcher,
            cursor: start,
            done: false,
            stop,
        }
    }

    /// Cursor the next fetch will use.
    pub fn cursor(&self) -> Option<&F::Cursor> {
        self.cursor.as_ref()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn into_inner(self) -> F {
        self.fetcher
    }

    pub async fn next_page(&mut self) -> Option<Result<F::Page, ConnectorError>> {
        if self.done {
            return None;
        }
        if self.stop.is_cancelled() {
            self.done = true;
            return None;
        }

        let fetched = tokio::select! {
            result = self.fetcher.fetch(self.cursor.as_ref()) => result,
            _ = self.stop.cancelled() => {
                self.done = true;
                return None;
            }
        };

        let page = match fetched {
            Ok(page) => page,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };

        match self.fetcher.next_cursor(&page) {
            Some(next) if self.cursor.as_ref() != Some(&next) => self.cursor = Some(next),
            Some(next) => {
                tracing::debug!(cursor = ?next, "Cursor did not advance, ending pagination");
                self.done = true;
            }
            None => self.done = true,
        }
        Some(Ok(page))
    }
}
