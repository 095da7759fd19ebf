//! The backend seam.
//!
//! Both code-generation strategies implement [`SerializerBuilder`], so the
//! caller picks a backend once and everything downstream is identical.

use std::sync::Arc;

use crate::error::BuildError;
use crate::serializer::SerializerFactory;
use crate::target::{EnumDescriptor, PolymorphismSchema, SerializationTarget};

pub trait SerializerBuilder {
    /// Build a serializer factory for an object-shaped target.
    fn build_serializer(
        &self,
        target: Arc<SerializationTarget>,
        schema: Option<Arc<PolymorphismSchema>>,
    ) -> Result<SerializerFactory, BuildError>;

    /// Build a serializer factory for an enum-shaped target.
    fn build_enum_serializer(
        &self,
        desc: Arc<EnumDescriptor>,
    ) -> Result<SerializerFactory, BuildError>;
}
