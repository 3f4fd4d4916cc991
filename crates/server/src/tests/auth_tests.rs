use super::*;

#[test]
fn minted_token_verifies_to_its_subject() {
    let issuer = TokenIssuer::new("devsecret", 60);
    let token = issuer.mint(&UserId::new("alice")).expect("token");

    assert_eq!(issuer.verify(&token).expect("verify"), UserId::new("alice"));

    let decoded = decode::<serde_json::Value>(
        &token,
        &DecodingKey::from_secret(b"devsecret"),
        &Validation::default(),
    )
    .expect("decode");
    assert_eq!(decoded.claims["sub"], "alice");
    assert_eq!(decoded.claims["role"], "authenticated");
}

#[test]
fn token_signed_with_another_secret_is_rejected() {
    let token = TokenIssuer::new("one", 60)
        .mint(&UserId::new("alice"))
        .expect("token");
    let err = TokenIssuer::new("two", 60).verify(&token).expect_err("bad signature");
    assert_eq!(err.code, ErrorCode::Unauthorized);
}

#[test]
fn expired_token_is_rejected() {
    let issuer = TokenIssuer::new("devsecret", -3600);
    let token = issuer.mint(&UserId::new("alice")).expect("token");
    assert_eq!(
        issuer.verify(&token).expect_err("expired").code,
        ErrorCode::Unauthorized
    );
}

#[test]
fn bearer_prefix_is_required() {
    assert_eq!(bearer_token("Bearer abc"), Some("abc"));
    assert_eq!(bearer_token("bearer abc "), Some("abc"));
    assert_eq!(bearer_token("Basic abc"), None);
    assert_eq!(bearer_token("Bearer "), None);
}
