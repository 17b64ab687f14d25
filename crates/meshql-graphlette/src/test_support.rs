use async_trait::async_trait;

use meshql_core::envelope::{Envelope, Params, Timestamp};
use meshql_core::error::MeshqlResult;
use meshql_core::template::QueryTemplate;
use meshql_core::traits::Searcher;

mockall::mock! {
    pub Searcher {}

    #[async_trait]
    impl Searcher for Searcher {
        async fn find(
            &self,
            template: &QueryTemplate,
            params: &Params,
            credentials: &[String],
            at: Timestamp,
        ) -> MeshqlResult<Option<Envelope>>;

        async fn find_all(
            &self,
            template: &QueryTemplate,
            params: &Params,
            credentials: &[String],
            at: Timestamp,
        ) -> MeshqlResult<Vec<Envelope>>;
    }
}
