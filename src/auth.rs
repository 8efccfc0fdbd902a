use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, error, info};
use reqwest::Method;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::{Token, TokenRequest, TokenResponse};
use crate::transport::{HttpRequest, HttpTransport};

/// Credentials exchanged for an access token
#[derive(Debug, Clone)]
pub struct Credentials {
    pub token_endpoint_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
}

impl From<&Config> for Credentials {
    fn from(config: &Config) -> Self {
        Self {
            token_endpoint_url: config.token_endpoint_url.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        }
    }
}

type RefreshFuture = Shared<BoxFuture<'static, Result<Token>>>;

/// Exchange currently in flight; every caller that finds the token invalid
/// awaits this one instead of starting its own.
struct InFlight {
    id: u64,
    future: RefreshFuture,
    waiters: usize,
}

#[derive(Default)]
struct AuthState {
    token: Option<Token>,
    in_flight: Option<InFlight>,
    next_exchange_id: u64,
    last_error: Option<Error>,
}

/// One caller's share of an in-flight exchange.
///
/// When the last waiter goes away before the exchange finishes, the exchange
/// is discarded so it is neither resumed later nor kept alive by the state.
struct ExchangeWaiter<'a> {
    state: &'a Mutex<AuthState>,
    id: u64,
    future: RefreshFuture,
}

impl Drop for ExchangeWaiter<'_> {
    fn drop(&mut self) {
        let mut state = lock(self.state);
        let abandoned = match state.in_flight.as_mut() {
            Some(in_flight) if in_flight.id == self.id => {
                in_flight.waiters -= 1;
                in_flight.waiters == 0
            }
            _ => false,
        };
        if abandoned {
            debug!("Token exchange abandoned by all callers, discarding it");
            state.in_flight = None;
        }
    }
}

/// Owns one access token and keeps it valid.
///
/// Concurrent callers that find the token expired share a single credential
/// exchange and all observe its outcome.
pub struct TokenAuthority {
    transport: Arc<dyn HttpTransport>,
    credentials: Arc<Credentials>,
    skew_margin: Duration,
    state: Arc<Mutex<AuthState>>,
}

impl TokenAuthority {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        credentials: Credentials,
        skew_margin: Duration,
    ) -> Self {
        Self {
            transport,
            credentials: Arc::new(credentials),
            skew_margin,
            state: Arc::new(Mutex::new(AuthState::default())),
        }
    }

    pub fn from_config(transport: Arc<dyn HttpTransport>, config: &Config) -> Self {
        Self::new(
            transport,
            Credentials::from(config),
            config.clock_skew_margin(),
        )
    }

    /// Return a valid access token, exchanging credentials first if needed
    pub async fn get_access_token(&self) -> Result<String> {
        let token = self.valid_token().await?;
        Ok(token.access_token)
    }

    /// Whether a token is held and expires after `now + skew margin`. No I/O.
    pub fn is_valid(&self) -> bool {
        lock(&self.state)
            .token
            .as_ref()
            .is_some_and(|token| token.is_valid(self.skew_margin))
    }

    pub async fn ensure_token_valid(&self) -> Result<()> {
        self.valid_token().await.map(|_| ())
    }

    /// Current token, valid or not
    pub fn token(&self) -> Option<Token> {
        lock(&self.state).token.clone()
    }

    /// Failure of the most recent exchange, cleared by the next success
    pub fn last_error(&self) -> Option<Error> {
        lock(&self.state).last_error.clone()
    }

    /// Drop the current token so the next request performs a fresh exchange
    pub fn invalidate(&self) {
        let mut state = lock(&self.state);
        if state.token.take().is_some() {
            debug!("Access token invalidated");
        }
    }

    /// Drop the current token only if it is still `access_token`.
    ///
    /// A rejection of an older token leaves a newer one in place.
    pub fn invalidate_token(&self, access_token: &str) {
        let mut state = lock(&self.state);
        if state
            .token
            .as_ref()
            .is_some_and(|token| token.access_token == access_token)
        {
            state.token = None;
            debug!("Access token invalidated");
        }
    }

    pub fn skew_margin(&self) -> Duration {
        self.skew_margin
    }

    async fn valid_token(&self) -> Result<Token> {
        let mut waiter = {
            let mut state = lock(&self.state);
            if let Some(token) = state
                .token
                .as_ref()
                .filter(|token| token.is_valid(self.skew_margin))
            {
                return Ok(token.clone());
            }
            let state = &mut *state;
            let next_id = state.next_exchange_id;
            let in_flight = state.in_flight.get_or_insert_with(|| InFlight {
                id: next_id,
                future: self.start_exchange(next_id),
                waiters: 0,
            });
            if in_flight.id == next_id {
                state.next_exchange_id += 1;
            }
            in_flight.waiters += 1;
            ExchangeWaiter {
                state: &self.state,
                id: in_flight.id,
                future: in_flight.future.clone(),
            }
        };
        (&mut waiter.future).await
    }

    fn start_exchange(&self, id: u64) -> RefreshFuture {
        let transport = Arc::clone(&self.transport);
        let credentials = Arc::clone(&self.credentials);
        let state = Arc::clone(&self.state);

        async move {
            let result = exchange_credentials(transport.as_ref(), &credentials).await;

            let mut state = lock(&state);
            if state.in_flight.as_ref().is_some_and(|f| f.id == id) {
                state.in_flight = None;
            }
            match &result {
                Ok(token) => {
                    state.token = Some(token.clone());
                    state.last_error = None;
                }
                // A stale token stays in place but is already invalid, so the
                // next caller retries the exchange.
                Err(e) => state.last_error = Some(e.clone()),
            }
            result
        }
        .boxed()
        .shared()
    }
}

fn lock(state: &Mutex<AuthState>) -> MutexGuard<'_, AuthState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Exchange username and password for a new token
async fn exchange_credentials(
    transport: &dyn HttpTransport,
    credentials: &Credentials,
) -> Result<Token> {
    debug!("Requesting access token for user: {}", credentials.username);

    let payload = TokenRequest::password_grant(
        &credentials.username,
        &credentials.password,
        &credentials.client_id,
        &credentials.client_secret,
    );
    let request = HttpRequest::new(Method::POST, credentials.token_endpoint_url.as_str())
        .json(serde_json::to_value(&payload)?);

    let response = transport.request(request).await.inspect_err(|e| {
        error!("Token request failed: {}", e);
    })?;

    if !response.is_success() {
        error!("Token request rejected with status: {}", response.status);
        return Err(Error::Authentication {
            status: response.status,
            body: response.body_text(),
        });
    }

    match serde_json::from_value::<TokenResponse>(response.body.clone()) {
        Ok(token_response) => {
            let token = Token::issue(token_response, response.status);
            info!("New token will expire at {}", token.expires_at_utc());
            Ok(token)
        }
        Err(e) => {
            debug!("Failed to parse token response: {}", e);
            Err(Error::Parse(format!("Failed to parse token response: {}", e)))
        }
    }
}
