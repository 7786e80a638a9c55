use std::path::{Path, PathBuf};

use pointcloud_core::PointCloudResult;

use crate::{PointCloudStore, StoreConfig};

const DEFAULT_DB_NAME: &str = "pointcloud.sqlite";

pub fn load_or_init_config(base: &Path) -> PointCloudResult<StoreConfig> {
    let default_sqlite = base.join(DEFAULT_DB_NAME);
    StoreConfig::load_or_init(base, &default_sqlite)
}

pub fn open_store(base: &Path) -> PointCloudResult<PointCloudStore> {
    let config = load_or_init_config(base)?;
    PointCloudStore::connect(&config, base)
}

pub fn default_sqlite_path(base: &Path) -> PathBuf {
    base.join(DEFAULT_DB_NAME)
}
