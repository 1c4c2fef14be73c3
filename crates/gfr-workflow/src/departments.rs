//! 科室配置来源

use async_trait::async_trait;
use gfr_core::{Department, Result};

/// 科室配置来源；每次轮询开始时读取，配置修改无需重启
#[async_trait]
pub trait DepartmentDirectory: Send + Sync {
    async fn departments(&self) -> Result<Vec<Department>>;
}

/// 固定的科室列表
#[derive(Debug, Clone, Default)]
pub struct StaticDepartments {
    departments: Vec<Department>,
}

impl StaticDepartments {
    pub fn new(departments: Vec<Department>) -> Self {
        Self { departments }
    }
}

#[async_trait]
impl DepartmentDirectory for StaticDepartments {
    async fn departments(&self) -> Result<Vec<Department>> {
        Ok(self.departments.clone())
    }
}
