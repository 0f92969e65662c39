//! ObjectManager trait - capability to create, find and destroy token objects

use super::{Attribute, AttributeType, ObjectHandle, TokenResult};
use crate::model::Mechanism;

/// Capability to manage token objects
///
/// Templates are plain attribute lists. Whether an object lives in the
/// session or on the token is decided by its `CKA_TOKEN` attribute.
pub trait ObjectManager {
    /// `C_CreateObject`
    fn create_object(&mut self, template: &[Attribute]) -> TokenResult<ObjectHandle>;

    /// `C_CopyObject`; attributes in `template` override the source
    fn copy_object(
        &mut self,
        object: ObjectHandle,
        template: &[Attribute],
    ) -> TokenResult<ObjectHandle>;

    /// `C_DestroyObject`
    fn destroy_object(&mut self, object: ObjectHandle) -> TokenResult<()>;

    /// `C_FindObjectsInit` / `C_FindObjects` / `C_FindObjectsFinal`
    ///
    /// Returns every visible object whose attributes match all of `template`.
    fn find_objects(&mut self, template: &[Attribute]) -> TokenResult<Vec<ObjectHandle>>;

    /// `C_GetAttributeValue`
    ///
    /// Returns the requested attributes the object carries and skips the
    /// ones it does not.
    ///
    /// # Errors
    ///
    /// `CKR_ATTRIBUTE_SENSITIVE` if any requested attribute may not be
    /// revealed.
    fn get_attributes(
        &mut self,
        object: ObjectHandle,
        types: &[AttributeType],
    ) -> TokenResult<Vec<Attribute>>;

    /// `C_GenerateKey`
    fn generate_key(
        &mut self,
        mechanism: &Mechanism,
        template: &[Attribute],
    ) -> TokenResult<ObjectHandle>;

    /// `C_GenerateKeyPair`; returns `(public, private)`
    fn generate_key_pair(
        &mut self,
        mechanism: &Mechanism,
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> TokenResult<(ObjectHandle, ObjectHandle)>;

    /// `C_DeriveKey`
    fn derive_key(
        &mut self,
        mechanism: &Mechanism,
        base_key: ObjectHandle,
        template: &[Attribute],
    ) -> TokenResult<ObjectHandle>;

    /// `C_WrapKey`
    fn wrap_key(
        &mut self,
        mechanism: &Mechanism,
        wrapping_key: ObjectHandle,
        key: ObjectHandle,
    ) -> TokenResult<Vec<u8>>;

    /// `C_UnwrapKey`
    fn unwrap_key(
        &mut self,
        mechanism: &Mechanism,
        unwrapping_key: ObjectHandle,
        wrapped_key: &[u8],
        template: &[Attribute],
    ) -> TokenResult<ObjectHandle>;
}
