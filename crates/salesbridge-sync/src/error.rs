use salesbridge_http::{ApiError, ErrorKind};
use thiserror::Error;

use crate::booking::BookingState;

/// Coarse classification used for propagation decisions and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncErrorKind {
    Api(ErrorKind),
    InsufficientIdentity,
    Persistence,
    Config,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("record carries neither an email nor a phone number")]
    InsufficientIdentity,
    #[error("no scheduling guest for contact {0}")]
    GuestNotFound(String),
    #[error("cannot create guest: {0}")]
    IncompleteGuest(String),
    #[error("persistence error: {0}")]
    Store(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("no location configured for {0}")]
    UnknownLocation(String),
    #[error("calendar {0} is not mapped to a staff member")]
    UnknownCalendar(String),
    #[error("block slot {0} has no CRM event id")]
    MissingEventId(String),
    #[error("booking failed after reaching {state:?} (booking id {booking_id:?}): {source}")]
    Booking {
        state: BookingState,
        booking_id: Option<String>,
        #[source]
        source: ApiError,
    },
}

impl SyncError {
    pub fn kind(&self) -> SyncErrorKind {
        match self {
            Self::Api(err) | Self::Booking { source: err, .. } => SyncErrorKind::Api(err.kind()),
            Self::GuestNotFound(_) => SyncErrorKind::Api(ErrorKind::NotFound),
            Self::InsufficientIdentity | Self::IncompleteGuest(_) => {
                SyncErrorKind::InsufficientIdentity
            }
            Self::Store(_) | Self::Migrate(_) | Self::MissingEventId(_) => {
                SyncErrorKind::Persistence
            }
            Self::Config(_) | Self::UnknownLocation(_) | Self::UnknownCalendar(_) => {
                SyncErrorKind::Config
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.kind(), SyncErrorKind::Api(ErrorKind::NotFound))
    }

    /// True when the location's credentials can no longer be refreshed.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self.kind(), SyncErrorKind::Api(ErrorKind::AuthExpired))
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_errors_keep_their_http_kind() {
        let err = SyncError::from(ApiError::Http {
            method: "GET".into(),
            endpoint: "/guests/search".into(),
            status: 404,
            body: "guest not found".into(),
        });
        assert!(err.is_not_found());
        assert!(SyncError::GuestNotFound("c-1".into()).is_not_found());

        let booking = SyncError::Booking {
            state: BookingState::Reserved,
            booking_id: Some("b-1".into()),
            source: ApiError::Http {
                method: "POST".into(),
                endpoint: "/bookings/b-1/slots/confirm".into(),
                status: 400,
                body: "slot taken".into(),
            },
        };
        assert_eq!(booking.kind(), SyncErrorKind::Api(ErrorKind::RemoteRejected));
        assert!(booking.to_string().contains("Reserved"));
    }

    #[test]
    fn identity_and_config_errors_have_their_own_kinds() {
        assert_eq!(
            SyncError::InsufficientIdentity.kind(),
            SyncErrorKind::InsufficientIdentity
        );
        assert_eq!(
            SyncError::UnknownLocation("c-9".into()).kind(),
            SyncErrorKind::Config
        );
    }
}
