use std::sync::Arc;

use application::Hub;

use crate::JwtService;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub jwt_service: Arc<JwtService>,
}

impl AppState {
    pub fn new(hub: Arc<Hub>, jwt_service: Arc<JwtService>) -> Self {
        Self { hub, jwt_service }
    }
}
