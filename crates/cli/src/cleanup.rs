use futures::future::BoxFuture;
use tracing::debug;

/// Deferred teardown actions owned by the top-level run scope, executed in
/// reverse registration order exactly once. Workers register nothing here;
/// this covers run-scoped resources (CI finalization, progress clearing).
pub struct CleanupStack {
    actions: Vec<(&'static str, BoxFuture<'static, ()>)>,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self { actions: Vec::new() }
    }

    pub fn push(&mut self, label: &'static str, action: BoxFuture<'static, ()>) {
        self.actions.push((label, action));
    }

    pub async fn run(mut self) {
        while let Some((label, action)) = self.actions.pop() {
            debug!(step = label, "running cleanup");
            action.await;
        }
    }
}
