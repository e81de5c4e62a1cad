pub const PROXY_RESULT_KEY: &str = "X-Chronocache-Result";
pub const NEGATIVE_KEY_PREFIX: &str = "neg.";

pub const NAME_IF_NONE_MATCH: &str = "If-None-Match";
pub const NAME_IF_MODIFIED_SINCE: &str = "If-Modified-Since";
pub const NAME_IF_MATCH: &str = "If-Match";
pub const NAME_IF_UNMODIFIED_SINCE: &str = "If-Unmodified-Since";

pub const VALUE_MULTIPART_BYTE_RANGES: &str = "multipart/byteranges";
