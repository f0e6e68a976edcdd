//! JWT 认证模块
//!
//! 提供 JWT token 生成、验证。token 中携带用户 id 与信任等级，
//! 信任等级决定该用户的限流配额。

use config::JwtConfig;
use domain::{UserClass, UserId};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 认证错误
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token 无效: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
}

/// JWT Claims 结构
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// 用户 id
    pub sub: i64,
    /// 用户信任等级
    pub class: UserClass,
    /// 过期时间 (Unix timestamp)
    pub exp: i64,
}

impl Claims {
    pub fn user_id(&self) -> UserId {
        UserId::new(self.sub)
    }
}

/// JWT Token 服务
#[derive(Clone)]
pub struct JwtService {
    config: JwtConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtService {
    pub fn new(config: JwtConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_ref());
        let decoding_key = DecodingKey::from_secret(config.secret.as_ref());

        Self {
            config,
            encoding_key,
            decoding_key,
        }
    }

    /// 生成 JWT token
    pub fn generate_token(&self, user_id: UserId, class: UserClass) -> Result<String, AuthError> {
        let now = chrono::Utc::now();
        let exp = now + chrono::Duration::hours(self.config.expiration_hours);

        let claims = Claims {
            sub: user_id.0,
            class,
            exp: exp.timestamp(),
        };

        Ok(encode(&Header::default(), &claims, &self.encoding_key)?)
    }

    /// 验证并解析 JWT token
    pub fn verify_token(&self, token: &str) -> Result<Claims, AuthError> {
        let data = decode::<Claims>(token, &self.decoding_key, &Validation::default())?;
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_service() -> JwtService {
        JwtService::new(JwtConfig {
            secret: "unit-test-secret-key-of-sufficient-length".to_string(),
            expiration_hours: 1,
        })
    }

    #[test]
    fn token_round_trip_preserves_identity() {
        let service = test_service();
        let token = service
            .generate_token(UserId::new(42), UserClass::Trusted)
            .unwrap();

        let claims = service.verify_token(&token).unwrap();
        assert_eq!(claims.user_id(), UserId::new(42));
        assert_eq!(claims.class, UserClass::Trusted);
        assert!(claims.exp > chrono::Utc::now().timestamp());
    }

    #[test]
    fn tampered_token_is_rejected() {
        let service = test_service();
        let token = service
            .generate_token(UserId::new(7), UserClass::New)
            .unwrap();

        let mut tampered = token.clone();
        tampered.push('x');
        assert!(service.verify_token(&tampered).is_err());
    }

    #[test]
    fn token_from_other_secret_is_rejected() {
        let service = test_service();
        let other = JwtService::new(JwtConfig {
            secret: "a-completely-different-secret-key-value".to_string(),
            expiration_hours: 1,
        });

        let token = other
            .generate_token(UserId::new(7), UserClass::New)
            .unwrap();
        assert!(service.verify_token(&token).is_err());
    }
}
