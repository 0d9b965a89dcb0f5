//! Destination address validation.

use std::sync::LazyLock;

use regex::Regex;

/// Optional leading `+`, then digits, dots and dashes only.
static GLOBAL_PHONE_NUMBER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\+?[0-9.\-]+$").ok());

/// Decides whether a destination address is worth handing to the transport.
pub trait AddressValidator: Send + Sync {
    /// `true` if `address` is syntactically well formed.
    fn is_well_formed(&self, address: &str) -> bool;
}

/// Accepts global phone numbers such as `+1-555-010.0199` or `0123456789`.
///
/// Purely syntactic: no length, country-code or reachability checks.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalPhoneNumber;

impl AddressValidator for GlobalPhoneNumber {
    fn is_well_formed(&self, address: &str) -> bool {
        !address.is_empty()
            && GLOBAL_PHONE_NUMBER
                .as_ref()
                .is_some_and(|re| re.is_match(address))
    }
}
