use futures::stream::{FuturesUnordered, StreamExt};

use super::request::Request;
use crate::error::FlowError;

/// A batch of requests that succeed or fail together.
///
/// [`wait_all`](RequestPool::wait_all) returns the results in insertion
/// order. The first failure cancels every request that has not finished yet.
pub struct RequestPool<T> {
    requests: Vec<Request<T>>,
}

impl<T: Clone + Send + Sync + 'static> Default for RequestPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> RequestPool<T> {
    pub fn new() -> Self {
        Self {
            requests: Vec::new(),
        }
    }

    pub fn add(&mut self, request: Request<T>) {
        self.requests.push(request);
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn submit_all(&self) -> Result<(), FlowError> {
        for request in &self.requests {
            request.submit()?;
        }
        Ok(())
    }

    pub fn cancel_all(&self) {
        for request in &self.requests {
            request.cancel();
        }
    }

    /// Submit every request and wait for all of them.
    pub async fn wait_all(self) -> Result<Vec<T>, FlowError> {
        if let Err(err) = self.submit_all() {
            self.cancel_all();
            return Err(err);
        }

        let mut pending: FuturesUnordered<_> = self
            .requests
            .iter()
            .enumerate()
            .map(|(i, request)| async move { (i, request.wait().await) })
            .collect();

        let mut results: Vec<Option<T>> = vec![None; self.requests.len()];
        while let Some((i, outcome)) = pending.next().await {
            match outcome {
                Ok(value) => results[i] = Some(value),
                Err(err) => {
                    drop(pending);
                    self.cancel_all();
                    return Err(err);
                }
            }
        }

        results
            .into_iter()
            .map(|r| r.ok_or_else(|| FlowError::Internal("pool request produced no result".into())))
            .collect()
    }
}
