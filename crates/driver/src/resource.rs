//! Generic remote-resource invocation.
//!
//! The proxy exposes its server-side objects (connection, statement,
//! result set, LOB, savepoint, transaction) through a single
//! invoke-remote-operation shape: a resource kind, a resource identifier,
//! and a target call naming the member plus a serialized parameter list.
//! The response carries a replacement session and a serialized return
//! value whose shape the caller chooses when decoding.

use ojp_proto::proto;
use serde::Serialize;

use crate::codec;
use crate::error::Result;

/// A member invocation to perform on a remote resource.
#[derive(Debug, Clone)]
pub struct ResourceCall {
    kind: proto::CallKind,
    member: String,
    parameters: Vec<u8>,
}

impl ResourceCall {
    /// Creates a call with no parameters.
    #[must_use]
    pub fn new(kind: proto::CallKind, member: impl Into<String>) -> Self {
        Self { kind, member: member.into(), parameters: Vec::new() }
    }

    /// Creates a call with a serialized parameter list.
    ///
    /// # Errors
    ///
    /// Returns a codec error when the parameters cannot be serialized.
    pub fn with_params<P: Serialize + ?Sized>(
        kind: proto::CallKind,
        member: impl Into<String>,
        params: &P,
    ) -> Result<Self> {
        Ok(Self { kind, member: member.into(), parameters: codec::encode(params)? })
    }

    /// Reads an attribute of the remote resource.
    #[must_use]
    pub fn get(member: impl Into<String>) -> Self {
        Self::new(proto::CallKind::Get, member)
    }

    /// Writes an attribute of the remote resource.
    ///
    /// # Errors
    ///
    /// Returns a codec error when the value cannot be serialized.
    pub fn set<P: Serialize + ?Sized>(member: impl Into<String>, value: &P) -> Result<Self> {
        Self::with_params(proto::CallKind::Set, member, value)
    }

    /// Invokes a method on the remote resource.
    ///
    /// # Errors
    ///
    /// Returns a codec error when the parameters cannot be serialized.
    pub fn invoke<P: Serialize + ?Sized>(member: impl Into<String>, params: &P) -> Result<Self> {
        Self::with_params(proto::CallKind::Call, member, params)
    }

    /// Queries the length of the remote resource (LOBs).
    #[must_use]
    pub fn length() -> Self {
        Self::new(proto::CallKind::Length, "")
    }

    /// Releases the remote resource.
    #[must_use]
    pub fn free() -> Self {
        Self::new(proto::CallKind::Free, "")
    }

    /// Returns the call kind.
    #[must_use]
    pub fn kind(&self) -> proto::CallKind {
        self.kind
    }

    /// Returns the member name.
    #[must_use]
    pub fn member(&self) -> &str {
        &self.member
    }

    pub(crate) fn into_target(self) -> proto::TargetCall {
        proto::TargetCall {
            kind: self.kind as i32,
            member: self.member,
            parameters: self.parameters,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn plain_call_has_no_parameters() {
        let call = ResourceCall::get("autoCommit");
        assert_eq!(call.kind(), proto::CallKind::Get);
        assert_eq!(call.member(), "autoCommit");

        let target = call.into_target();
        assert_eq!(target.kind, proto::CallKind::Get as i32);
        assert!(target.parameters.is_empty());
    }

    #[test]
    fn parameters_roundtrip_through_the_target() {
        let call = ResourceCall::invoke("setFetchSize", &(100u32,)).unwrap();
        let target = call.into_target();
        let decoded: (u32,) = codec::decode(&target.parameters).unwrap();
        assert_eq!(decoded, (100,));
    }

    #[test]
    fn set_serializes_the_value() {
        let call = ResourceCall::set("readOnly", &true).unwrap();
        let target = call.into_target();
        let decoded: bool = codec::decode(&target.parameters).unwrap();
        assert!(decoded);
    }

    #[test]
    fn length_and_free_are_member_less() {
        assert_eq!(ResourceCall::length().member(), "");
        assert_eq!(ResourceCall::length().kind(), proto::CallKind::Length);
        assert_eq!(ResourceCall::free().kind(), proto::CallKind::Free);
    }
}
