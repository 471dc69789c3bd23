mod common;

use common::TestApp;
use serde_json::json;
use service_core::axum::http::{Method, StatusCode};
use uuid::Uuid;

/// Creates `resource:action`, a role holding it, and returns `(role_id, permission_id)`.
async fn role_with_permission(
    app: &TestApp,
    admin: &str,
    role_name: &str,
    resource: &str,
    action: &str,
) -> (String, String) {
    let permission = app
        .call(
            Method::POST,
            "/api/v1/permissions",
            Some(admin),
            Some(json!({ "resource": resource, "action": action })),
        )
        .await;
    assert_eq!(permission.status, StatusCode::CREATED, "{}", permission.body);
    assert_eq!(
        permission.data()["name"],
        format!("{}:{}", resource, action)
    );
    let permission_id = permission.data()["id"].as_str().unwrap().to_string();

    let role = app
        .call(
            Method::POST,
            "/api/v1/roles",
            Some(admin),
            Some(json!({ "name": role_name, "display_name": "Test Role" })),
        )
        .await;
    assert_eq!(role.status, StatusCode::CREATED, "{}", role.body);
    let role_id = role.data()["id"].as_str().unwrap().to_string();

    let granted = app
        .call(
            Method::POST,
            &format!("/api/v1/roles/{}/permissions", role_id),
            Some(admin),
            Some(json!({ "permission_ids": [permission_id] })),
        )
        .await;
    assert_eq!(granted.status, StatusCode::OK, "{}", granted.body);

    (role_id, permission_id)
}

async fn assign(app: &TestApp, admin: &str, user_id: &str, role_id: &str) {
    let res = app
        .call(
            Method::POST,
            &format!("/api/v1/users/{}/roles", user_id),
            Some(admin),
            Some(json!({ "role_id": role_id })),
        )
        .await;
    assert_eq!(res.status, StatusCode::CREATED, "{}", res.body);
}

#[tokio::test]
async fn test_granted_role_confers_permission_until_deactivated() {
    let app = TestApp::spawn().await;
    let admin = app.admin_token().await;
    let (bob_id, _) = app.user("bob@ex.com", "B0bPassword").await;
    let bob = Uuid::parse_str(&bob_id).unwrap();

    let (role_id, _) = role_with_permission(&app, &admin, "analyst", "reports", "read").await;
    assert!(!app
        .state
        .rbac
        .user_has_permission(bob, "reports", "read")
        .await
        .unwrap());

    assign(&app, &admin, &bob_id, &role_id).await;
    assert!(app
        .state
        .rbac
        .user_has_permission(bob, "reports", "read")
        .await
        .unwrap());
    assert!(app
        .state
        .rbac
        .user_has_permission_by_name(bob, "reports:read")
        .await
        .unwrap());

    let res = app
        .call(
            Method::PUT,
            &format!("/api/v1/roles/{}", role_id),
            Some(&admin),
            Some(json!({ "is_active": false })),
        )
        .await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.data()["is_active"], false);

    assert!(!app
        .state
        .rbac
        .user_has_permission(bob, "reports", "read")
        .await
        .unwrap());
}

#[tokio::test]
async fn test_dynamic_rule_follows_granted_permissions() {
    let app = TestApp::spawn().await;
    let admin = app.admin_token().await;
    let (bob_id, bob_token) = app.user("bob@ex.com", "B0bPassword").await;

    let denied = app
        .call(Method::GET, "/api/v1/roles", Some(&bob_token), None)
        .await;
    assert_eq!(denied.status, StatusCode::FORBIDDEN);
    assert_eq!(denied.body["error"]["code"], "FORBIDDEN");

    let (role_id, _) = role_with_permission(&app, &admin, "role_reader", "roles", "read").await;
    assign(&app, &admin, &bob_id, &role_id).await;

    let listed = app
        .call(Method::GET, "/api/v1/roles", Some(&bob_token), None)
        .await;
    assert_eq!(listed.status, StatusCode::OK);
    assert!(listed.data()["items"].is_array());

    // read does not imply create
    let create = app
        .call(
            Method::POST,
            "/api/v1/roles",
            Some(&bob_token),
            Some(json!({ "name": "sneaky", "display_name": "Sneaky" })),
        )
        .await;
    assert_eq!(create.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_revoked_permission_stops_granting() {
    let app = TestApp::spawn().await;
    let admin = app.admin_token().await;
    let (bob_id, _) = app.user("bob@ex.com", "B0bPassword").await;
    let bob = Uuid::parse_str(&bob_id).unwrap();

    let (role_id, permission_id) =
        role_with_permission(&app, &admin, "analyst", "reports", "export").await;
    assign(&app, &admin, &bob_id, &role_id).await;

    let perms = app
        .call(
            Method::GET,
            &format!("/api/v1/users/{}/permissions", bob_id),
            Some(&admin),
            None,
        )
        .await;
    assert_eq!(perms.status, StatusCode::OK);
    assert_eq!(perms.data()[0]["name"], "reports:export");
    assert_eq!(perms.data()[0]["granted_by_role"], "analyst");

    let revoked = app
        .call(
            Method::DELETE,
            &format!("/api/v1/roles/{}/permissions/{}", role_id, permission_id),
            Some(&admin),
            None,
        )
        .await;
    assert_eq!(revoked.status, StatusCode::OK);
    assert!(!app
        .state
        .rbac
        .user_has_permission(bob, "reports", "export")
        .await
        .unwrap());
}

#[tokio::test]
async fn test_unassigned_role_is_dropped() {
    let app = TestApp::spawn().await;
    let admin = app.admin_token().await;
    let (bob_id, _) = app.user("bob@ex.com", "B0bPassword").await;

    let (role_id, _) = role_with_permission(&app, &admin, "analyst", "reports", "read").await;
    assign(&app, &admin, &bob_id, &role_id).await;

    let roles = app
        .call(
            Method::GET,
            &format!("/api/v1/users/{}/roles", bob_id),
            Some(&admin),
            None,
        )
        .await;
    assert_eq!(roles.status, StatusCode::OK);
    assert_eq!(roles.data()["roles"], json!(["analyst"]));

    let res = app
        .call(
            Method::DELETE,
            &format!("/api/v1/users/{}/roles/{}", bob_id, role_id),
            Some(&admin),
            None,
        )
        .await;
    assert_eq!(res.status, StatusCode::OK);

    let roles = app
        .call(
            Method::GET,
            &format!("/api/v1/users/{}/roles", bob_id),
            Some(&admin),
            None,
        )
        .await;
    assert_eq!(roles.data()["roles"], json!([]));
}

#[tokio::test]
async fn test_reassignment_is_an_upsert() {
    let app = TestApp::spawn().await;
    let admin = app.admin_token().await;
    let (bob_id, _) = app.user("bob@ex.com", "B0bPassword").await;
    let (role_id, _) = role_with_permission(&app, &admin, "analyst", "reports", "read").await;
    assign(&app, &admin, &bob_id, &role_id).await;
    assign(&app, &admin, &bob_id, &role_id).await;

    let roles = app
        .call(
            Method::GET,
            &format!("/api/v1/users/{}/roles", bob_id),
            Some(&admin),
            None,
        )
        .await;
    assert_eq!(roles.data()["roles"], json!(["analyst"]));
}

#[tokio::test]
async fn test_owner_rule_on_user_records() {
    let app = TestApp::spawn().await;
    let admin = app.admin_token().await;
    let (alice_id, alice) = app.user("alice@ex.com", "P@ssw0rd").await;
    let (bob_id, _) = app.user("bob@ex.com", "B0bPassword").await;

    let own = app
        .call(Method::GET, &format!("/api/v1/users/{}", alice_id), Some(&alice), None)
        .await;
    assert_eq!(own.status, StatusCode::OK);

    let other = app
        .call(Method::GET, &format!("/api/v1/users/{}", bob_id), Some(&alice), None)
        .await;
    assert_eq!(other.status, StatusCode::FORBIDDEN);

    let renamed = app
        .call(
            Method::PATCH,
            &format!("/api/v1/users/{}", alice_id),
            Some(&alice),
            Some(json!({ "name": "Alice A." })),
        )
        .await;
    assert_eq!(renamed.status, StatusCode::OK);
    assert_eq!(renamed.data()["name"], "Alice A.");

    let by_admin = app
        .call(Method::GET, &format!("/api/v1/users/{}", bob_id), Some(&admin), None)
        .await;
    assert_eq!(by_admin.status, StatusCode::OK);
}

#[tokio::test]
async fn test_user_administration_requires_permission() {
    let app = TestApp::spawn().await;
    let admin = app.admin_token().await;
    let (alice_id, alice) = app.user("alice@ex.com", "P@ssw0rd").await;
    let (bob_id, _) = app.user("bob@ex.com", "B0bPassword").await;

    let list = app.call(Method::GET, "/api/v1/users", Some(&alice), None).await;
    assert_eq!(list.status, StatusCode::FORBIDDEN);

    // owning the record is not enough to delete it
    let delete_self = app
        .call(Method::DELETE, &format!("/api/v1/users/{}", alice_id), Some(&alice), None)
        .await;
    assert_eq!(delete_self.status, StatusCode::FORBIDDEN);

    let list = app.call(Method::GET, "/api/v1/users", Some(&admin), None).await;
    assert_eq!(list.status, StatusCode::OK);
    assert_eq!(list.data()["total"], 3);

    let deactivated = app
        .call(
            Method::POST,
            &format!("/api/v1/users/{}/deactivate", bob_id),
            Some(&admin),
            None,
        )
        .await;
    assert_eq!(deactivated.status, StatusCode::OK);
    assert_eq!(deactivated.data()["is_active"], false);
    assert_eq!(deactivated.data()["state"], "inactive");
    assert_eq!(
        app.login("bob@ex.com", "B0bPassword").await.status,
        StatusCode::UNAUTHORIZED
    );

    let deleted = app
        .call(Method::DELETE, &format!("/api/v1/users/{}", bob_id), Some(&admin), None)
        .await;
    assert_eq!(deleted.status, StatusCode::OK);
    let gone = app
        .call(Method::GET, &format!("/api/v1/users/{}", bob_id), Some(&admin), None)
        .await;
    assert_eq!(gone.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_admin_creates_user_with_chosen_state() {
    let app = TestApp::spawn().await;
    let admin = app.admin_token().await;

    let res = app
        .call(
            Method::POST,
            "/api/v1/users",
            Some(&admin),
            Some(json!({
                "email": "Erin@Ex.com",
                "name": "Erin",
                "password": "Er1nPassword",
                "email_verified": true
            })),
        )
        .await;
    assert_eq!(res.status, StatusCode::CREATED, "{}", res.body);
    assert_eq!(res.data()["email"], "erin@ex.com");
    assert_eq!(res.data()["email_verified"], true);

    assert_eq!(
        app.login("erin@ex.com", "Er1nPassword").await.status,
        StatusCode::OK
    );
}
