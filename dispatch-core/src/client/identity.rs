use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Claims of a service-to-service token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceClaims {
    /// Issuing (calling) service
    pub iss: String,
    /// Target service
    pub aud: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
}

impl ServiceClaims {
    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// A token together with the claims it was signed from.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub claims: ServiceClaims,
}

/// Signs outbound and verifies inbound service tokens (HS256, shared secret).
#[derive(Clone)]
pub struct ServiceIdentity {
    service_name: String,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl ServiceIdentity {
    pub fn new(service_name: impl Into<String>, secret: &Secret<String>) -> Self {
        let secret = secret.expose_secret().as_bytes();
        Self {
            service_name: service_name.into(),
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Sign a token asserting this service towards `audience`.
    pub fn issue(&self, audience: &str) -> Result<IssuedToken, jsonwebtoken::errors::Error> {
        let claims = ServiceClaims {
            iss: self.service_name.clone(),
            aud: audience.to_string(),
            iat: Utc::now().timestamp(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?;
        Ok(IssuedToken { token, claims })
    }

    /// Verify a token addressed to this service.
    pub fn verify(&self, token: &str) -> Result<ServiceClaims, jsonwebtoken::errors::Error> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[&self.service_name]);
        validation.set_required_spec_claims(&["aud", "iss"]);
        validation.validate_exp = false;

        let data = decode::<ServiceClaims>(token, &self.decoding_key, &validation)?;
        Ok(data.claims)
    }
}
