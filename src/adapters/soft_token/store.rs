//! Object storage of the software token

use std::collections::BTreeMap;

use crate::ports::{Attribute, AttributeList, AttributeType, KeyType, ObjectClass, ObjectHandle};

/// A token object: nothing but its attributes
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SoftObject {
    attributes: Vec<Attribute>,
}

impl SoftObject {
    pub fn new(attributes: Vec<Attribute>) -> Self {
        let mut object = Self {
            attributes: Vec::with_capacity(attributes.len()),
        };
        for attribute in attributes {
            object.set(attribute);
        }
        object
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// Replace the attribute of the same type, or add it
    pub fn set(&mut self, attribute: Attribute) {
        let kind = attribute.attribute_type();
        match self
            .attributes
            .iter_mut()
            .find(|existing| existing.attribute_type() == kind)
        {
            Some(existing) => *existing = attribute,
            None => self.attributes.push(attribute),
        }
    }

    pub fn set_default(&mut self, attribute: Attribute) {
        if self.attributes.find_attribute(attribute.attribute_type()).is_none() {
            self.attributes.push(attribute);
        }
    }

    /// Whether every attribute of `template` is present with the same value
    pub fn matches(&self, template: &[Attribute]) -> bool {
        template
            .iter()
            .all(|wanted| self.attributes.find_attribute(wanted.attribute_type()) == Some(wanted))
    }

    pub fn class(&self) -> Option<ObjectClass> {
        self.attributes.object_class()
    }

    pub fn key_type(&self) -> Option<KeyType> {
        self.attributes.key_type()
    }

    pub fn flag(&self, kind: AttributeType) -> bool {
        self.attributes.flag(kind).unwrap_or(false)
    }

    pub fn bytes(&self, kind: AttributeType) -> Option<&[u8]> {
        self.attributes.bytes(kind)
    }

    pub fn ulong(&self, kind: AttributeType) -> Option<u64> {
        self.attributes.ulong(kind)
    }

    pub fn is_token(&self) -> bool {
        self.flag(AttributeType::TOKEN)
    }

    pub fn is_private(&self) -> bool {
        self.flag(AttributeType::PRIVATE)
    }

    /// Whether secret material may be read out of the object
    pub fn reveals_material(&self) -> bool {
        !self.flag(AttributeType::SENSITIVE)
            && self
                .attributes
                .flag(AttributeType::EXTRACTABLE)
                .unwrap_or(true)
    }
}

/// Handle-indexed object table
#[derive(Debug, Default)]
pub(crate) struct ObjectStore {
    objects: BTreeMap<ObjectHandle, SoftObject>,
}

impl ObjectStore {
    pub fn get(&self, handle: ObjectHandle) -> Option<&SoftObject> {
        self.objects.get(&handle)
    }

    pub fn insert(&mut self, handle: ObjectHandle, object: SoftObject) {
        self.objects.insert(handle, object);
    }

    pub fn remove(&mut self, handle: ObjectHandle) -> Option<SoftObject> {
        self.objects.remove(&handle)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn clear(&mut self) {
        self.objects.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectHandle, &SoftObject)> {
        self.objects.iter().map(|(handle, object)| (*handle, object))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_replaces_same_type() {
        let mut object = SoftObject::new(vec![
            Attribute::Label(b"first".to_vec()),
            Attribute::Label(b"second".to_vec()),
        ]);
        assert_eq!(object.attributes().len(), 1);
        assert_eq!(object.bytes(AttributeType::LABEL), Some(&b"second"[..]));

        object.set_default(Attribute::Label(b"ignored".to_vec()));
        assert_eq!(object.bytes(AttributeType::LABEL), Some(&b"second"[..]));
    }

    #[test]
    fn test_matches_template() {
        let object = SoftObject::new(vec![
            Attribute::Class(ObjectClass::SECRET_KEY),
            Attribute::Label(b"k".to_vec()),
        ]);
        assert!(object.matches(&[]));
        assert!(object.matches(&[Attribute::Label(b"k".to_vec())]));
        assert!(!object.matches(&[Attribute::Label(b"x".to_vec())]));
        assert!(!object.matches(&[Attribute::Id(vec![1])]));
    }

    #[test]
    fn test_material_visibility() {
        let open = SoftObject::new(vec![
            Attribute::Sensitive(false),
            Attribute::Extractable(true),
        ]);
        let sensitive = SoftObject::new(vec![
            Attribute::Sensitive(true),
            Attribute::Extractable(true),
        ]);
        let locked = SoftObject::new(vec![Attribute::Extractable(false)]);
        assert!(open.reveals_material());
        assert!(!sensitive.reveals_material());
        assert!(!locked.reveals_material());
    }
}
