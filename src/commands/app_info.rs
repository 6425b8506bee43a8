use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInfoResponse {
    pub product_name: String,
    pub version: String,
    pub description: String,
    pub platform: String,
    pub arch: String,
}

pub fn build_app_info_response(
    product_name: String,
    version: String,
    description: String,
) -> AppInfoResponse {
    AppInfoResponse {
        product_name,
        version,
        description,
        platform: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
    }
}

pub fn app_info() -> AppInfoResponse {
    build_app_info_response(
        env!("CARGO_PKG_NAME").to_string(),
        env!("CARGO_PKG_VERSION").to_string(),
        env!("CARGO_PKG_DESCRIPTION").to_string(),
    )
}
