//! OCI building blocks: references, media types, descriptors, digests and
//! the `Target` storage trait.

pub mod descriptor;
pub mod digest;
pub mod media_type;
pub mod reference;
pub mod target;

pub use descriptor::{Descriptor, Index, Manifest, REF_NAME_ANNOTATION, VERSION_ANNOTATION};
pub use digest::{sha256_digest, DigestVerifier, Hasher, HashingWriter, VerifyingReader};
pub use media_type::{
    BaseType, Compression, MediaType, CONFIG_MEDIA_TYPE, INDEX_MEDIA_TYPE, MANIFEST_MEDIA_TYPE,
};
pub use reference::{
    format_for_display, is_digest, is_modelkit_reference, validate_tag, Reference, DEFAULT_REGISTRY,
    DEFAULT_REPOSITORY,
};
pub use target::{
    fetch_all, get_config, get_manifest, get_manifest_and_config, read_to_vec, BlobReader,
    FetchedBlob, Target,
};
