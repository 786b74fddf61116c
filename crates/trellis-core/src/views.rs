//! Template engine seam.
//!
//! Trellis does not ship a template language; applications plug one in
//! through [`Views`] and call [`Ctx::render`](crate::Ctx::render).

use serde_json::Value;

use crate::error::Result;

/// A template engine.
pub trait Views: Send + Sync {
    /// Loads or reloads templates. Called once when the engine is
    /// installed.
    fn load(&self) -> Result<()> {
        Ok(())
    }

    /// Renders `name` with `data` into `out`, optionally wrapped in
    /// `layout`.
    fn render(&self, out: &mut Vec<u8>, name: &str, data: &Value, layout: Option<&str>)
        -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    struct Echo;

    impl Views for Echo {
        fn render(
            &self,
            out: &mut Vec<u8>,
            name: &str,
            data: &Value,
            layout: Option<&str>,
        ) -> Result<()> {
            if name == "missing" {
                return Err(Error::internal("template not found"));
            }
            out.extend_from_slice(format!("{}:{}:{}", layout.unwrap_or("-"), name, data).as_bytes());
            Ok(())
        }
    }

    #[test]
    fn test_engine_contract() {
        let engine = Echo;
        engine.load().unwrap();
        let mut out = Vec::new();
        engine
            .render(&mut out, "index", &serde_json::json!({"a": 1}), Some("main"))
            .unwrap();
        assert_eq!(out, br#"main:index:{"a":1}"#);
        assert!(engine.render(&mut out, "missing", &Value::Null, None).is_err());
    }
}
