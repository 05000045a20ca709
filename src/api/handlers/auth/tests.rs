//! Router-level tests for the auth endpoints, run against the in-memory store.

use super::{AuthConfig, AuthState, SESSION_COOKIE_NAME};
use crate::api::{
    self,
    email::{process_outbox_batch, EmailMessage, EmailWorkerConfig, MemoryEmailSender},
};
use crate::store::{CreateUserOutcome, DynStore, MemoryStore, NewUser, Store, User};
use anyhow::{anyhow, Context, Result};
use axum::{
    body::Body,
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE, COOKIE, SET_COOKIE, WWW_AUTHENTICATE},
        HeaderMap, Method, Request, StatusCode,
    },
    Router,
};
use regex::Regex;
use secrecy::SecretString;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const NAME: &str = "item4";
const ADDRESS: &str = "item4@example.com";
const PASSWORD: &str = "$uper$escret$uper$escret$uper$escret";
const NEW_PASSWORD: &str = "nEwpa$$wordnEwpa$$wordnEwpa$$word";

struct TestApp {
    app: Router,
    store: Arc<MemoryStore>,
    auth_state: Arc<AuthState>,
    sender: MemoryEmailSender,
}

struct TestResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Value,
}

impl TestApp {
    fn new() -> Result<Self> {
        let store = Arc::new(MemoryStore::new());
        let dyn_store: DynStore = store.clone();
        // Cheap Argon2 parameters keep the suite fast.
        let config = AuthConfig::default().with_password_hash_cost(64, 1);
        let auth_state = Arc::new(AuthState::new(
            config,
            SecretString::from("test-secret-key".to_string()),
        )?);
        let app = api::app(dyn_store, auth_state.clone())?;
        Ok(Self {
            app,
            store,
            auth_state,
            sender: MemoryEmailSender::new(),
        })
    }

    async fn send(&self, request: Request<Body>) -> Result<TestResponse> {
        let response = self.app.clone().oneshot(request).await?;
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).context("response body is not JSON")?
        };
        Ok(TestResponse {
            status,
            headers,
            body,
        })
    }

    async fn post_json(&self, uri: &str, body: &Value) -> Result<TestResponse> {
        self.send(json_request(Method::POST, uri, body, None)?).await
    }

    async fn post_form(&self, uri: &str, pairs: &[(&str, &str)]) -> Result<TestResponse> {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body))?;
        self.send(request).await
    }

    async fn get(&self, uri: &str, token: Option<&str>) -> Result<TestResponse> {
        let mut builder = Request::builder().method(Method::GET).uri(uri);
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Token {token}"));
        }
        self.send(builder.body(Body::empty())?).await
    }

    /// Run the outbox worker once and return everything delivered so far.
    async fn deliver(&self) -> Result<Vec<EmailMessage>> {
        process_outbox_batch(
            self.store.as_ref(),
            &self.sender,
            &EmailWorkerConfig::new(),
        )
        .await?;
        Ok(self.sender.sent())
    }

    async fn create_user(&self, email: &str, password: &str, verified: bool) -> Result<User> {
        let password_hash = self.auth_state.hash_password(password.to_string()).await?;
        let outcome = self
            .store
            .create_user(
                NewUser {
                    email: email.to_string(),
                    name: NAME.to_string(),
                    tz: "Asia/Seoul".to_string(),
                    password_hash,
                    email_verified: verified,
                },
                None,
            )
            .await?;
        match outcome {
            CreateUserOutcome::Created(user) => Ok(user),
            CreateUserOutcome::EmailTaken => Err(anyhow!("{email} already exists")),
        }
    }

    async fn login(&self, email: &str, password: &str) -> Result<String> {
        let res = self
            .post_json(
                "/auth/login/",
                &json!({"email": email, "password": password}),
            )
            .await?;
        res.body["key"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("login failed: {}", res.body))
    }

    async fn check_password(&self, email: &str, password: &str) -> Result<bool> {
        let user = self
            .store
            .user_by_email(email)
            .await?
            .context("user not found")?;
        self.auth_state
            .verify_password(password.to_string(), Some(user.password_hash))
            .await
    }
}

fn json_request(
    method: Method,
    uri: &str,
    body: &Value,
    token: Option<&str>,
) -> Result<Request<Body>> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(AUTHORIZATION, format!("Token {token}"));
    }
    Ok(builder.body(Body::from(serde_json::to_vec(body)?))?)
}

fn register_body(overrides: Value) -> Value {
    let mut body = json!({
        "name": NAME,
        "email": ADDRESS,
        "password1": PASSWORD,
        "password2": PASSWORD,
        "tz": "Asia/Tokyo",
    });
    if let (Some(body), Value::Object(overrides)) = (body.as_object_mut(), overrides) {
        body.extend(overrides);
    }
    body
}

fn capture<'a>(pattern: &str, haystack: &'a str) -> Result<Vec<&'a str>> {
    let re = Regex::new(pattern)?;
    let captures = re
        .captures(haystack)
        .ok_or_else(|| anyhow!("{pattern} not found in {haystack}"))?;
    Ok(captures
        .iter()
        .skip(1)
        .flatten()
        .map(|m| m.as_str())
        .collect())
}

fn confirm_path(message: &EmailMessage) -> Result<String> {
    Ok(capture(r"(/auth/confirm/.+?/)", &message.body)?[0].to_string())
}

fn reset_link(message: &EmailMessage) -> Result<(String, String)> {
    let groups = capture(r"/auth/password/reset/(.+?)/(.+?)/", &message.body)?;
    Ok((groups[0].to_string(), groups[1].to_string()))
}

#[tokio::test]
async fn register_fine() -> Result<()> {
    let app = TestApp::new()?;

    let res = app.post_json("/auth/register/", &register_body(json!({}))).await?;
    assert_eq!(res.status, StatusCode::CREATED);
    assert_eq!(res.body["detail"], "Verification e-mail sent.");

    let user = app.store.user_by_email(ADDRESS).await?.context("user")?;
    assert!(!user.email_verified);

    let sent = app.deliver().await?;
    assert_eq!(sent.len(), 1);
    let mail = &sent[0];
    assert_eq!(
        mail.subject,
        "[item4.net] innocent 회원 가입을 위해 E-mail 주소를 확인해주세요!"
    );
    assert!(mail.body.contains(ADDRESS));
    assert_eq!(mail.to_email, ADDRESS);

    let res = app.get(&confirm_path(mail)?, None).await?;
    assert_eq!(res.status, StatusCode::OK);
    assert!(res.body["key"].as_str().is_some_and(|key| !key.is_empty()));

    let res = app.post_json("/auth/confirm/", &res.body).await?;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["detail"], "ok");

    let user = app.store.user_by_email(ADDRESS).await?.context("user")?;
    assert!(user.email_verified);
    assert_eq!(user.tz, "Asia/Tokyo");
    assert_eq!(user.name, NAME);
    Ok(())
}

#[tokio::test]
async fn register_no_fields() -> Result<()> {
    let app = TestApp::new()?;
    let res = app.post_json("/auth/register/", &json!({})).await?;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    for field in ["email", "password1", "password2", "name", "tz"] {
        assert_eq!(res.body[field], json!(["This field is required."]), "{field}");
    }
    Ok(())
}

#[tokio::test]
async fn register_empty_fields() -> Result<()> {
    let app = TestApp::new()?;
    let body = json!({"name": "", "email": "", "password1": "", "password2": "", "tz": ""});
    let res = app.post_json("/auth/register/", &body).await?;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    for field in ["email", "password1", "password2", "name", "tz"] {
        assert_eq!(
            res.body[field],
            json!(["This field may not be blank."]),
            "{field}"
        );
    }
    Ok(())
}

#[tokio::test]
async fn register_invalid_email() -> Result<()> {
    let app = TestApp::new()?;
    let body = register_body(json!({"email": "invalid#example.com"}));
    let res = app.post_json("/auth/register/", &body).await?;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(res.body["email"], json!(["Enter a valid email address."]));
    Ok(())
}

#[tokio::test]
async fn register_invalid_password() -> Result<()> {
    let app = TestApp::new()?;
    let body = register_body(json!({"password1": "1234", "password2": "1234"}));
    let res = app.post_json("/auth/register/", &body).await?;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(
        res.body["password1"],
        json!([
            "This password is too short. It must contain at least 16 characters.",
            "This password is too common.",
            "This password is entirely numeric.",
        ])
    );
    Ok(())
}

#[tokio::test]
async fn register_accepts_password_resembling_email() -> Result<()> {
    let app = TestApp::new()?;
    let password = format!("{ADDRESS}42");
    let body = register_body(json!({"password1": password, "password2": password}));
    let res = app.post_json("/auth/register/", &body).await?;
    assert_eq!(res.status, StatusCode::CREATED);
    assert!(app.check_password(ADDRESS, &password).await?);
    Ok(())
}

#[tokio::test]
async fn register_different_password() -> Result<()> {
    let app = TestApp::new()?;
    let body = register_body(json!({"password2": "supersescretsupersescretsupersescret"}));
    let res = app.post_json("/auth/register/", &body).await?;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(
        res.body["non_field_errors"],
        json!(["The two password fields didn't match."])
    );
    Ok(())
}

#[tokio::test]
async fn register_long_name() -> Result<()> {
    let app = TestApp::new()?;
    let name = format!("item{}", "4".repeat(100));
    let res = app
        .post_json("/auth/register/", &register_body(json!({"name": name})))
        .await?;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(
        res.body["name"],
        json!(["Ensure this field has no more than 25 characters."])
    );
    Ok(())
}

#[tokio::test]
async fn register_duplicate_email() -> Result<()> {
    let app = TestApp::new()?;
    app.create_user(ADDRESS, PASSWORD, true).await?;

    // Normalization makes the second address collide with the first.
    let body = register_body(json!({"email": " Item4@Example.COM "}));
    let res = app.post_json("/auth/register/", &body).await?;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(
        res.body["email"],
        json!(["A user is already registered with this e-mail address."])
    );
    Ok(())
}

#[tokio::test]
async fn confirm_key_is_single_use() -> Result<()> {
    let app = TestApp::new()?;
    app.post_json("/auth/register/", &register_body(json!({})))
        .await?;
    let sent = app.deliver().await?;
    let res = app.get(&confirm_path(&sent[0])?, None).await?;
    let key = res.body.clone();

    let res = app.post_json("/auth/confirm/", &key).await?;
    assert_eq!(res.status, StatusCode::OK);

    let res = app.post_json("/auth/confirm/", &key).await?;
    assert_eq!(res.status, StatusCode::NOT_FOUND);
    assert_eq!(res.body["detail"], "Not found.");
    Ok(())
}

#[tokio::test]
async fn confirm_unknown_or_expired_key_is_not_found() -> Result<()> {
    let app = TestApp::new()?;
    let res = app.get("/auth/confirm/unknown-key/", None).await?;
    assert_eq!(res.status, StatusCode::NOT_FOUND);

    app.post_json("/auth/register/", &register_body(json!({})))
        .await?;
    let sent = app.deliver().await?;
    let path = confirm_path(&sent[0])?;
    app.store
        .age_confirmations(chrono::Duration::days(4))
        .await;

    let res = app.get(&path, None).await?;
    assert_eq!(res.status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn confirm_landing_and_missing_key() -> Result<()> {
    let app = TestApp::new()?;
    let res = app.get("/auth/confirm/", None).await?;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["detail"], "Verification e-mail sent.");

    let res = app.post_json("/auth/confirm/", &json!({})).await?;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(res.body["key"], json!(["This field is required."]));
    Ok(())
}

#[tokio::test]
async fn resend_respects_cooldown() -> Result<()> {
    let app = TestApp::new()?;
    app.post_json("/auth/register/", &register_body(json!({})))
        .await?;
    assert_eq!(app.deliver().await?.len(), 1);

    let res = app
        .post_json("/auth/confirm/resend/", &json!({"email": ADDRESS}))
        .await?;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["detail"], "ok");
    assert_eq!(app.deliver().await?.len(), 1);

    app.store
        .age_confirmations(chrono::Duration::seconds(181))
        .await;
    app.post_json("/auth/confirm/resend/", &json!({"email": ADDRESS}))
        .await?;
    let sent = app.deliver().await?;
    assert_eq!(sent.len(), 2);
    assert_ne!(confirm_path(&sent[0])?, confirm_path(&sent[1])?);

    // Unknown addresses get the same answer and no e-mail.
    let res = app
        .post_json("/auth/confirm/resend/", &json!({"email": "nobody@example.com"}))
        .await?;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(app.deliver().await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn login_fine() -> Result<()> {
    let app = TestApp::new()?;
    let user = app.create_user(ADDRESS, PASSWORD, true).await?;
    assert!(user.last_login.is_none());

    let res = app
        .post_json("/auth/login/", &json!({"email": ADDRESS, "password": PASSWORD}))
        .await?;
    assert_eq!(res.status, StatusCode::OK);
    let key = res.body["key"].as_str().unwrap_or_default();
    assert_eq!(key.len(), 40);
    assert!(key.chars().all(|c| c.is_ascii_hexdigit()));

    let cookie = res
        .headers
        .get(SET_COOKIE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    assert!(cookie.starts_with(&format!("{SESSION_COOKIE_NAME}={key}")));
    assert!(cookie.contains("HttpOnly"));

    let user = app.store.user_by_email(ADDRESS).await?.context("user")?;
    assert!(user.last_login.is_some());
    Ok(())
}

#[tokio::test]
async fn login_no_verified() -> Result<()> {
    let app = TestApp::new()?;
    app.create_user(ADDRESS, PASSWORD, false).await?;
    let res = app
        .post_json("/auth/login/", &json!({"email": ADDRESS, "password": PASSWORD}))
        .await?;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(res.body["non_field_errors"], json!(["E-mail is not verified."]));
    Ok(())
}

#[tokio::test]
async fn login_wrong_email() -> Result<()> {
    let app = TestApp::new()?;
    let res = app
        .post_json("/auth/login/", &json!({"email": ADDRESS, "password": PASSWORD}))
        .await?;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(
        res.body["non_field_errors"],
        json!(["Unable to log in with provided credentials."])
    );
    Ok(())
}

#[tokio::test]
async fn login_wrong_password() -> Result<()> {
    let app = TestApp::new()?;
    app.create_user(ADDRESS, PASSWORD, true).await?;
    let body = json!({"email": ADDRESS, "password": "wrongpa$$wordwrongpa$$wordwrongpa$$word"});
    let res = app.post_json("/auth/login/", &body).await?;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(
        res.body["non_field_errors"],
        json!(["Unable to log in with provided credentials."])
    );
    Ok(())
}

#[tokio::test]
async fn login_missing_fields() -> Result<()> {
    let app = TestApp::new()?;
    let res = app
        .post_json("/auth/login/", &json!({"password": PASSWORD}))
        .await?;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(
        res.body["non_field_errors"],
        json!(["Must include \"email\" and \"password\"."])
    );

    let res = app.post_json("/auth/login/", &json!({"email": ADDRESS})).await?;
    assert_eq!(res.body["password"], json!(["This field is required."]));
    Ok(())
}

#[tokio::test]
async fn logout() -> Result<()> {
    let app = TestApp::new()?;
    let res = app.post_json("/auth/logout/", &json!({})).await?;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["detail"], "Successfully logged out.");
    let cookie = res
        .headers
        .get(SET_COOKIE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    assert!(cookie.contains("Max-Age=0"));
    Ok(())
}

#[tokio::test]
async fn logout_revokes_token() -> Result<()> {
    let app = TestApp::new()?;
    app.create_user(ADDRESS, PASSWORD, true).await?;
    let key = app.login(ADDRESS, PASSWORD).await?;

    let res = app.get("/users/me/", Some(&key)).await?;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["email"], ADDRESS);

    let res = app
        .send(json_request(Method::POST, "/auth/logout/", &json!({}), Some(&key))?)
        .await?;
    assert_eq!(res.status, StatusCode::OK);

    let res = app.get("/users/me/", Some(&key)).await?;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);
    assert_eq!(res.body["detail"], "Invalid token.");
    Ok(())
}

#[tokio::test]
async fn each_login_gets_its_own_token() -> Result<()> {
    let app = TestApp::new()?;
    app.create_user(ADDRESS, PASSWORD, true).await?;
    let laptop = app.login(ADDRESS, PASSWORD).await?;
    let phone = app.login(ADDRESS, PASSWORD).await?;
    assert_ne!(laptop, phone);

    let res = app
        .send(json_request(Method::POST, "/auth/logout/", &json!({}), Some(&laptop))?)
        .await?;
    assert_eq!(res.status, StatusCode::OK);

    let res = app.get("/users/me/", Some(&laptop)).await?;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);
    let res = app.get("/users/me/", Some(&phone)).await?;
    assert_eq!(res.status, StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn session_cookie_authenticates() -> Result<()> {
    let app = TestApp::new()?;
    app.create_user(ADDRESS, PASSWORD, true).await?;
    let key = app.login(ADDRESS, PASSWORD).await?;

    let request = Request::builder()
        .method(Method::GET)
        .uri("/users/me/")
        .header(COOKIE, format!("theme=dark; {SESSION_COOKIE_NAME}={key}"))
        .body(Body::empty())?;
    let res = app.send(request).await?;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["name"], NAME);
    assert_eq!(res.body["email_verified"], true);
    Ok(())
}

#[tokio::test]
async fn password_reset_fine() -> Result<()> {
    let app = TestApp::new()?;
    app.create_user(ADDRESS, PASSWORD, false).await?;

    let res = app
        .post_form("/auth/password/reset/", &[("email", ADDRESS)])
        .await?;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["detail"], "Password reset e-mail has been sent.");

    let sent = app.deliver().await?;
    let mail = sent.first().context("reset e-mail")?;
    assert_eq!(mail.subject, "innocent(item4.net) 비밀번호 리셋 요청");
    assert_eq!(mail.to_email, ADDRESS);

    let (uid, token) = reset_link(mail)?;
    let res = app
        .post_form(
            "/auth/password/reset/confirm/",
            &[
                ("new_password1", NEW_PASSWORD),
                ("new_password2", NEW_PASSWORD),
                ("uid", uid.as_str()),
                ("token", token.as_str()),
            ],
        )
        .await?;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(
        res.body["detail"],
        "Password has been reset with the new password."
    );
    assert!(app.check_password(ADDRESS, NEW_PASSWORD).await?);
    Ok(())
}

#[tokio::test]
async fn password_reset_unknown_email_sends_nothing() -> Result<()> {
    let app = TestApp::new()?;
    let res = app
        .post_json("/auth/password/reset/", &json!({"email": ADDRESS}))
        .await?;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["detail"], "Password reset e-mail has been sent.");
    assert!(app.deliver().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn password_reset_token_is_single_use() -> Result<()> {
    let app = TestApp::new()?;
    app.create_user(ADDRESS, PASSWORD, true).await?;
    let key = app.login(ADDRESS, PASSWORD).await?;

    app.post_json("/auth/password/reset/", &json!({"email": ADDRESS}))
        .await?;
    let sent = app.deliver().await?;
    let (uid, token) = reset_link(sent.first().context("reset e-mail")?)?;
    let body = json!({
        "new_password1": NEW_PASSWORD,
        "new_password2": NEW_PASSWORD,
        "uid": uid,
        "token": token,
    });

    let res = app.post_json("/auth/password/reset/confirm/", &body).await?;
    assert_eq!(res.status, StatusCode::OK);

    // Existing tokens are revoked by the reset.
    let res = app.get("/users/me/", Some(&key)).await?;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);

    // The password hash changed, so the same link no longer works.
    let res = app.post_json("/auth/password/reset/confirm/", &body).await?;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(res.body["token"], json!(["Invalid value"]));
    Ok(())
}

#[tokio::test]
async fn password_reset_confirm_validation_order() -> Result<()> {
    let app = TestApp::new()?;
    app.create_user(ADDRESS, PASSWORD, true).await?;
    app.post_json("/auth/password/reset/", &json!({"email": ADDRESS}))
        .await?;
    let sent = app.deliver().await?;
    let (uid, token) = reset_link(sent.first().context("reset e-mail")?)?;

    let res = app
        .post_json("/auth/password/reset/confirm/", &json!({}))
        .await?;
    for field in ["new_password1", "new_password2", "uid", "token"] {
        assert_eq!(res.body[field], json!(["This field is required."]), "{field}");
    }

    let res = app
        .post_json(
            "/auth/password/reset/confirm/",
            &json!({
                "new_password1": NEW_PASSWORD,
                "new_password2": NEW_PASSWORD,
                "uid": "garbage!",
                "token": token,
            }),
        )
        .await?;
    assert_eq!(res.body["uid"], json!(["Invalid value"]));

    let res = app
        .post_json(
            "/auth/password/reset/confirm/",
            &json!({
                "new_password1": NEW_PASSWORD,
                "new_password2": PASSWORD,
                "uid": uid,
                "token": "1-bad",
            }),
        )
        .await?;
    assert_eq!(
        res.body["new_password2"],
        json!(["The two password fields didn't match."])
    );
    assert!(res.body.get("token").is_none());

    let res = app
        .post_json(
            "/auth/password/reset/confirm/",
            &json!({
                "new_password1": NEW_PASSWORD,
                "new_password2": NEW_PASSWORD,
                "uid": uid,
                "token": "1-bad",
            }),
        )
        .await?;
    assert_eq!(res.body["token"], json!(["Invalid value"]));
    assert!(app.check_password(ADDRESS, PASSWORD).await?);
    Ok(())
}

#[tokio::test]
async fn password_change_fine() -> Result<()> {
    let app = TestApp::new()?;
    app.create_user(ADDRESS, PASSWORD, true).await?;
    let key = app.login(ADDRESS, PASSWORD).await?;

    let body = json!({
        "old_password": PASSWORD,
        "new_password1": NEW_PASSWORD,
        "new_password2": NEW_PASSWORD,
    });
    let res = app
        .send(json_request(
            Method::POST,
            "/auth/password/change/",
            &body,
            Some(&key),
        )?)
        .await?;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["detail"], "New password has been saved.");
    assert!(app.check_password(ADDRESS, NEW_PASSWORD).await?);

    // The token used for the change stays valid.
    let res = app.get("/users/me/", Some(&key)).await?;
    assert_eq!(res.status, StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn password_change_rejects_wrong_old_password() -> Result<()> {
    let app = TestApp::new()?;
    app.create_user(ADDRESS, PASSWORD, true).await?;
    let key = app.login(ADDRESS, PASSWORD).await?;

    let body = json!({
        "old_password": "not-the-password",
        "new_password1": NEW_PASSWORD,
        "new_password2": "1234",
    });
    let res = app
        .send(json_request(
            Method::POST,
            "/auth/password/change/",
            &body,
            Some(&key),
        )?)
        .await?;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(
        res.body["old_password"],
        json!(["Your old password was entered incorrectly. Please enter it again."])
    );
    assert_eq!(
        res.body["new_password2"],
        json!(["The two password fields didn't match."])
    );
    assert!(app.check_password(ADDRESS, PASSWORD).await?);
    Ok(())
}

#[tokio::test]
async fn password_change_rejects_password_similar_to_email() -> Result<()> {
    let app = TestApp::new()?;
    app.create_user(ADDRESS, PASSWORD, true).await?;
    let key = app.login(ADDRESS, PASSWORD).await?;

    let password = format!("{ADDRESS}42");
    let body = json!({
        "old_password": PASSWORD,
        "new_password1": password,
        "new_password2": password,
    });
    let res = app
        .send(json_request(
            Method::POST,
            "/auth/password/change/",
            &body,
            Some(&key),
        )?)
        .await?;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(
        res.body["new_password2"],
        json!(["The password is too similar to the email address."])
    );
    assert!(app.check_password(ADDRESS, PASSWORD).await?);
    Ok(())
}

#[tokio::test]
async fn password_change_requires_authentication() -> Result<()> {
    let app = TestApp::new()?;
    let body = json!({
        "old_password": PASSWORD,
        "new_password1": NEW_PASSWORD,
        "new_password2": NEW_PASSWORD,
    });
    let res = app.post_json("/auth/password/change/", &body).await?;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);
    assert_eq!(
        res.body["detail"],
        "Authentication credentials were not provided."
    );
    assert!(res.headers.contains_key(WWW_AUTHENTICATE));

    let res = app
        .send(json_request(
            Method::POST,
            "/auth/password/change/",
            &body,
            Some("0000000000000000000000000000000000000000"),
        )?)
        .await?;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);
    assert_eq!(res.body["detail"], "Invalid token.");
    Ok(())
}

#[tokio::test]
async fn users_me_updates_profile() -> Result<()> {
    let app = TestApp::new()?;
    app.create_user(ADDRESS, PASSWORD, true).await?;
    let key = app.login(ADDRESS, PASSWORD).await?;

    let res = app
        .send(json_request(
            Method::PATCH,
            "/users/me/",
            &json!({"name": "item5", "tz": "Europe/Paris"}),
            Some(&key),
        )?)
        .await?;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["name"], "item5");
    assert_eq!(res.body["tz"], "Europe/Paris");

    let res = app
        .send(json_request(
            Method::PATCH,
            "/users/me/",
            &json!({"tz": "Mars/Olympus"}),
            Some(&key),
        )?)
        .await?;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(res.body["tz"], json!(["\"Mars/Olympus\" is not a valid choice."]));

    let user = app.store.user_by_email(ADDRESS).await?.context("user")?;
    assert_eq!(user.name, "item5");
    assert_eq!(user.tz, "Europe/Paris");
    Ok(())
}

#[tokio::test]
async fn unsupported_media_type_and_bad_json() -> Result<()> {
    let app = TestApp::new()?;

    let request = Request::builder()
        .method(Method::POST)
        .uri("/auth/login/")
        .header(CONTENT_TYPE, "text/plain")
        .body(Body::from("hello"))?;
    let res = app.send(request).await?;
    assert_eq!(res.status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(
        res.body["detail"],
        "Unsupported media type \"text/plain\" in request."
    );

    let request = Request::builder()
        .method(Method::POST)
        .uri("/auth/login/")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from("{"))?;
    let res = app.send(request).await?;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert!(res.body["detail"]
        .as_str()
        .is_some_and(|detail| detail.starts_with("JSON parse error - ")));
    Ok(())
}

#[tokio::test]
async fn index_and_health() -> Result<()> {
    let app = TestApp::new()?;
    let res = app.get("/", None).await?;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["name"], env!("CARGO_PKG_NAME"));

    let res = app.get("/health", None).await?;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["database"], "ok");
    assert!(res.headers.contains_key("x-request-id"));
    Ok(())
}
