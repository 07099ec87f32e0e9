// ABOUTME: composes allow-list validation and supervised execution into the single execute entry point.
// ABOUTME: a rejected request never reaches the runner.

use std::sync::Arc;

use savalet_common::{ExecuteRequest, ExecuteResult};
use tracing::info;

use crate::policy::AllowList;
use crate::supervisor::Runner;

pub struct Mediator {
    allow_list: Arc<AllowList>,
    runner: Arc<dyn Runner>,
}

impl Mediator {
    pub fn new(allow_list: Arc<AllowList>, runner: Arc<dyn Runner>) -> Self {
        Mediator { allow_list, runner }
    }

    pub async fn execute(&self, request: &ExecuteRequest) -> ExecuteResult {
        let accepted = match self.allow_list.snapshot().validate(request) {
            Ok(accepted) => accepted,
            Err(rejection) => {
                info!(
                    command = %request.command,
                    code = rejection.code(),
                    reason = %rejection,
                    "request rejected"
                );
                return ExecuteResult::rejected(rejection.to_string());
            }
        };
        self.runner.run(accepted).await
    }
}
