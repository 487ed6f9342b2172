//! Wire constants shared by the aggregation server and the result submitter.

macro_rules! v1_path {
    ($path:literal) => {
        concat!("/api/v1", $path)
    };
}

/// Versioned API route definitions.
pub mod v1 {
    pub const ROOT: &str = "/api/v1";
    pub const VERSION: &str = "v1";

    pub mod results {
        /// Prefix workers for cluster-wide plugins post under.
        pub const GLOBAL: &str = v1_path!("/results/global");
        /// Prefix workers for per-node plugins post under.
        pub const BY_NODE: &str = v1_path!("/results/by-node");

        pub const GLOBAL_ITEM: &str = v1_path!("/results/global/{result_type}");
        pub const BY_NODE_ITEM: &str =
            v1_path!("/results/by-node/{node}/{result_type}");
    }

    pub const STATUS: &str = v1_path!("/status");
}

/// Header carrying the MIME type of a submitted payload.
pub const MIME_TYPE_HEADER: &str = "content-type";

/// MIME type used when a submitter does not name one.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Full URL of the global results prefix on `host`.
pub fn global_results_url(host: &str) -> String {
    format!("https://{host}{}", v1::results::GLOBAL)
}

/// Full URL of the per-node results prefix on `host`.
pub fn by_node_results_url(host: &str) -> String {
    format!("https://{host}{}", v1::results::BY_NODE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_are_versioned() {
        assert_eq!(v1::results::GLOBAL, "/api/v1/results/global");
        assert_eq!(
            v1::results::BY_NODE_ITEM,
            "/api/v1/results/by-node/{node}/{result_type}"
        );
        assert_eq!(
            global_results_url("10.0.0.1:8080"),
            "https://10.0.0.1:8080/api/v1/results/global"
        );
    }
}
