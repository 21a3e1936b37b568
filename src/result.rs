//! LDAP result codes (RFC 4511 section 4.1.9) and the domain error carried
//! through operations.

use std::fmt;
use thiserror::Error;

/// Numeric LDAP result code. Values are fixed by RFC 4511 and go on the wire as ENUMERATED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Success = 0,
    OperationsError = 1,
    ProtocolError = 2,
    TimeLimitExceeded = 3,
    SizeLimitExceeded = 4,
    CompareFalse = 5,
    CompareTrue = 6,
    AuthMethodNotSupported = 7,
    StrongAuthRequired = 8,
    Referral = 10,
    AdminLimitExceeded = 11,
    UnavailableCriticalExtension = 12,
    ConfidentialityRequired = 13,
    SaslBindInProgress = 14,
    NoSuchAttribute = 16,
    UndefinedAttributeType = 17,
    InappropriateMatching = 18,
    ConstraintViolation = 19,
    AttributeOrValueExists = 20,
    InvalidAttributeSyntax = 21,
    NoSuchObject = 32,
    AliasProblem = 33,
    InvalidDnSyntax = 34,
    IsLeaf = 35,
    AliasDereferencingProblem = 36,
    InappropriateAuthentication = 48,
    InvalidCredentials = 49,
    InsufficientAccessRights = 50,
    Busy = 51,
    Unavailable = 52,
    UnwillingToPerform = 53,
    LoopDetect = 54,
    NamingViolation = 64,
    ObjectClassViolation = 65,
    NotAllowedOnNonLeaf = 66,
    NotAllowedOnRdn = 67,
    EntryAlreadyExists = 68,
    ObjectClassModsProhibited = 69,
    AffectsMultipleDsas = 71,
    Other = 80,
}

impl ResultCode {
    pub const ALL: [ResultCode; 40] = [
        ResultCode::Success,
        ResultCode::OperationsError,
        ResultCode::ProtocolError,
        ResultCode::TimeLimitExceeded,
        ResultCode::SizeLimitExceeded,
        ResultCode::CompareFalse,
        ResultCode::CompareTrue,
        ResultCode::AuthMethodNotSupported,
        ResultCode::StrongAuthRequired,
        ResultCode::Referral,
        ResultCode::AdminLimitExceeded,
        ResultCode::UnavailableCriticalExtension,
        ResultCode::ConfidentialityRequired,
        ResultCode::SaslBindInProgress,
        ResultCode::NoSuchAttribute,
        ResultCode::UndefinedAttributeType,
        ResultCode::InappropriateMatching,
        ResultCode::ConstraintViolation,
        ResultCode::AttributeOrValueExists,
        ResultCode::InvalidAttributeSyntax,
        ResultCode::NoSuchObject,
        ResultCode::AliasProblem,
        ResultCode::InvalidDnSyntax,
        ResultCode::IsLeaf,
        ResultCode::AliasDereferencingProblem,
        ResultCode::InappropriateAuthentication,
        ResultCode::InvalidCredentials,
        ResultCode::InsufficientAccessRights,
        ResultCode::Busy,
        ResultCode::Unavailable,
        ResultCode::UnwillingToPerform,
        ResultCode::LoopDetect,
        ResultCode::NamingViolation,
        ResultCode::ObjectClassViolation,
        ResultCode::NotAllowedOnNonLeaf,
        ResultCode::NotAllowedOnRdn,
        ResultCode::EntryAlreadyExists,
        ResultCode::ObjectClassModsProhibited,
        ResultCode::AffectsMultipleDsas,
        ResultCode::Other,
    ];

    #[inline]
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.code() == code)
    }

    /// The RFC 4511 camel-case name, used in diagnostics and logs.
    pub fn name(self) -> &'static str {
        match self {
            ResultCode::Success => "success",
            ResultCode::OperationsError => "operationsError",
            ResultCode::ProtocolError => "protocolError",
            ResultCode::TimeLimitExceeded => "timeLimitExceeded",
            ResultCode::SizeLimitExceeded => "sizeLimitExceeded",
            ResultCode::CompareFalse => "compareFalse",
            ResultCode::CompareTrue => "compareTrue",
            ResultCode::AuthMethodNotSupported => "authMethodNotSupported",
            ResultCode::StrongAuthRequired => "strongAuthRequired",
            ResultCode::Referral => "referral",
            ResultCode::AdminLimitExceeded => "adminLimitExceeded",
            ResultCode::UnavailableCriticalExtension => "unavailableCriticalExtension",
            ResultCode::ConfidentialityRequired => "confidentialityRequired",
            ResultCode::SaslBindInProgress => "saslBindInProgress",
            ResultCode::NoSuchAttribute => "noSuchAttribute",
            ResultCode::UndefinedAttributeType => "undefinedAttributeType",
            ResultCode::InappropriateMatching => "inappropriateMatching",
            ResultCode::ConstraintViolation => "constraintViolation",
            ResultCode::AttributeOrValueExists => "attributeOrValueExists",
            ResultCode::InvalidAttributeSyntax => "invalidAttributeSyntax",
            ResultCode::NoSuchObject => "noSuchObject",
            ResultCode::AliasProblem => "aliasProblem",
            ResultCode::InvalidDnSyntax => "invalidDNSyntax",
            ResultCode::IsLeaf => "isLeaf",
            ResultCode::AliasDereferencingProblem => "aliasDereferencingProblem",
            ResultCode::InappropriateAuthentication => "inappropriateAuthentication",
            ResultCode::InvalidCredentials => "invalidCredentials",
            ResultCode::InsufficientAccessRights => "insufficientAccessRights",
            ResultCode::Busy => "busy",
            ResultCode::Unavailable => "unavailable",
            ResultCode::UnwillingToPerform => "unwillingToPerform",
            ResultCode::LoopDetect => "loopDetect",
            ResultCode::NamingViolation => "namingViolation",
            ResultCode::ObjectClassViolation => "objectClassViolation",
            ResultCode::NotAllowedOnNonLeaf => "notAllowedOnNonLeaf",
            ResultCode::NotAllowedOnRdn => "notAllowedOnRDN",
            ResultCode::EntryAlreadyExists => "entryAlreadyExists",
            ResultCode::ObjectClassModsProhibited => "objectClassModsProhibited",
            ResultCode::AffectsMultipleDsas => "affectsMultipleDSAs",
            ResultCode::Other => "other",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

/// A domain error: the request failed with a specific result code which is
/// reported to the client. The connection carries on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct LdapError {
    pub code: ResultCode,
    pub message: String,
}

impl LdapError {
    pub fn new(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ResultCode::ProtocolError, message)
    }

    pub fn operations(message: impl Into<String>) -> Self {
        Self::new(ResultCode::OperationsError, message)
    }

    pub fn no_such_object(dn: &str) -> Self {
        Self::new(ResultCode::NoSuchObject, format!("No such object: {}", dn))
    }

    pub fn unwilling(message: impl Into<String>) -> Self {
        Self::new(ResultCode::UnwillingToPerform, message)
    }

    pub fn object_class_violation(message: impl Into<String>) -> Self {
        Self::new(ResultCode::ObjectClassViolation, message)
    }

    pub fn constraint_violation(message: impl Into<String>) -> Self {
        Self::new(ResultCode::ConstraintViolation, message)
    }

    pub fn invalid_syntax(message: impl Into<String>) -> Self {
        Self::new(ResultCode::InvalidAttributeSyntax, message)
    }
}

impl From<ResultCode> for LdapError {
    fn from(code: ResultCode) -> Self {
        Self::new(code, "")
    }
}

pub type LdapResult<T> = std::result::Result<T, LdapError>;

/// Raised inside an operation once its cancellation token fires. The operation
/// boundary swallows it and sends nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation abandoned")]
pub struct Abandoned;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_values() {
        assert_eq!(ResultCode::Success.code(), 0);
        assert_eq!(ResultCode::OperationsError.code(), 1);
        assert_eq!(ResultCode::ProtocolError.code(), 2);
        assert_eq!(ResultCode::TimeLimitExceeded.code(), 3);
        assert_eq!(ResultCode::SizeLimitExceeded.code(), 4);
        assert_eq!(ResultCode::AuthMethodNotSupported.code(), 7);
        assert_eq!(ResultCode::ConstraintViolation.code(), 19);
        assert_eq!(ResultCode::NoSuchObject.code(), 32);
        assert_eq!(ResultCode::InvalidDnSyntax.code(), 34);
        assert_eq!(ResultCode::InvalidCredentials.code(), 49);
        assert_eq!(ResultCode::UnwillingToPerform.code(), 53);
        assert_eq!(ResultCode::ObjectClassViolation.code(), 65);
        assert_eq!(ResultCode::EntryAlreadyExists.code(), 68);
        assert_eq!(ResultCode::Other.code(), 80);
    }

    #[test]
    fn test_from_code_round_trip() {
        for code in ResultCode::ALL {
            assert_eq!(ResultCode::from_code(code.code()), Some(code));
        }
        assert_eq!(ResultCode::from_code(9), None);
        assert_eq!(ResultCode::from_code(1000), None);
    }

    #[test]
    fn test_error_display() {
        let err = LdapError::no_such_object("cn=x,dc=example");
        assert_eq!(err.code, ResultCode::NoSuchObject);
        assert_eq!(err.to_string(), "noSuchObject (32): No such object: cn=x,dc=example");
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = LdapError::unwilling("read only").into();
        let domain = err.downcast_ref::<LdapError>().unwrap();
        assert_eq!(domain.code, ResultCode::UnwillingToPerform);

        let err: anyhow::Error = Abandoned.into();
        assert!(err.is::<Abandoned>());
    }
}
