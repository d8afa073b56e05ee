use async_trait::async_trait;

use crate::error::Error;
use crate::resource::Resource;

/// A web search backend returning the top results for one query.
///
/// Results carry url/title/description only; content is fetched separately.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn search(&self, query: &str) -> Result<Vec<Resource>, Error>;
}
