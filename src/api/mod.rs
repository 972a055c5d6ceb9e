mod chain;
mod health;
mod miners;
pub mod models;
mod stats;
mod transactions;
mod users;

use actix_web::web::{self, ServiceConfig};

pub fn init_routes(cfg: &mut ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(health::health_check)
            .service(chain::get_chain)
            .service(chain::get_block)
            .service(chain::validate_chain)
            .service(stats::get_stats)
            .service(users::register_user)
            .service(users::get_user)
            .service(users::create_miner)
            .service(users::list_miners)
            .service(users::list_presence)
            .service(miners::get_miner)
            .service(transactions::post_transaction),
    );
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use actix_web::http::StatusCode;
    use actix_web::{App, test, web};
    use serde_json::{Value, json};

    use super::init_routes;
    use crate::app::AppState;
    use crate::blockchain::Block;
    use crate::config::Config;
    use crate::realtime::presence::Identity;
    use crate::store::{MemoryStore, Store};
    use crate::user::UserRecord;

    async fn state() -> (Arc<MemoryStore>, AppState) {
        let store = Arc::new(MemoryStore::new());
        let app = AppState::build(Config::default(), store.clone())
            .await
            .unwrap();
        (store, app)
    }

    #[actix_web::test]
    async fn health_and_empty_chain() {
        let (_, app_state) = state().await;
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(app_state))
                .configure(init_routes),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/health/").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);

        let req = test::TestRequest::get().uri("/api/v1/chain/").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["length"], 0);
        assert_eq!(body["difficulty"], 2);

        let req = test::TestRequest::get().uri("/api/v1/validate/").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["valid"], true);
    }

    #[actix_web::test]
    async fn blocks_are_fetched_by_height() {
        let (_, app_state) = state().await;
        let genesis = Block::new(0, 1_000, Vec::new(), "0".into(), 0, "m1".into());
        app_state.chain.add_block(genesis.clone()).await.unwrap();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(app_state))
                .configure(init_routes),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/chain/0/").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["hash"], genesis.hash.as_str());
        assert_eq!(body["miner_id"], "m1");

        let req = test::TestRequest::get().uri("/api/v1/chain/1/").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn presence_lists_connected_users() {
        let (store, app_state) = state().await;
        let alice = UserRecord::new("u1".into(), "alice".into(), 0);
        store.insert_user(&alice).await.unwrap();
        app_state.presence.connect(&Identity::user(&alice)).await.unwrap();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(app_state))
                .configure(init_routes),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/presence/").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        let users = body.as_array().unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0]["user_id"], "u1");
        assert_eq!(users[0]["status"], "online");
    }

    #[actix_web::test]
    async fn users_and_miners() {
        let (store, app_state) = state().await;
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(app_state))
                .configure(init_routes),
        )
        .await;

        let register = json!({"user_id": "u1", "username": "alice"});
        let req = test::TestRequest::post()
            .uri("/api/v1/users/")
            .set_json(&register)
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CREATED);

        let req = test::TestRequest::post()
            .uri("/api/v1/users/")
            .set_json(&register)
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CONFLICT);

        let req = test::TestRequest::post()
            .uri("/api/v1/users/")
            .set_json(json!({"user_id": "guest-1", "username": "x"}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::post()
            .uri("/api/v1/users/u1/miners/")
            .set_json(json!({"hash_rate": 50}))
            .to_request();
        let miner: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(miner["user_id"], "u1");
        assert_eq!(miner["active"], false);
        assert_eq!(miner["currency_code"], "LUX");

        let req = test::TestRequest::get().uri("/api/v1/users/u1/miners/").to_request();
        let listed: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let id = miner["id"].as_str().unwrap();
        let req = test::TestRequest::get()
            .uri(&format!("/api/v1/miners/{id}/"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
        assert!(store.get_miner(id).await.unwrap().is_some());

        let req = test::TestRequest::post()
            .uri("/api/v1/users/nobody/miners/")
            .set_json(json!({"hash_rate": 1}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn transactions_queue_for_the_next_height() {
        let (store, app_state) = state().await;
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(app_state))
                .configure(init_routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/v1/transactions/")
            .set_json(json!({"from": "a", "to": "b", "amount": 2.5, "fee": 0.5}))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["block_height"], 0);
        assert_eq!(store.pending_transactions(0).await.unwrap().len(), 1);

        // the same transfer again is a second transaction, not a conflict
        let req = test::TestRequest::post()
            .uri("/api/v1/transactions/")
            .set_json(json!({"from": "a", "to": "b", "amount": 2.5, "fee": 0.5}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CREATED);
        assert_eq!(store.pending_transactions(0).await.unwrap().len(), 2);

        let req = test::TestRequest::post()
            .uri("/api/v1/transactions/")
            .set_json(json!({"from": "a", "to": "b", "amount": 0.0}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
    }
}
