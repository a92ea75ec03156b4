use std::sync::Arc;

use crate::application::status::StatusResolver;
use crate::application::submission::SubmissionService;

#[derive(Clone)]
pub struct ApiState {
    pub submissions: Arc<SubmissionService>,
    pub status: Arc<StatusResolver>,
}
