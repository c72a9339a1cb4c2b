//! Project scaffolding for `sable new`

use std::fs;
use std::io;
use std::path::PathBuf;

const TEMPLATES: &[&str] = &["app", "lib"];

pub fn generate(template: &str, name: &str) -> io::Result<()> {
    if !TEMPLATES.contains(&template) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "unknown template '{}'; available: {}",
                template,
                TEMPLATES.join(", ")
            ),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        || name.is_empty()
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid project name '{}'", name),
        ));
    }

    let root = PathBuf::from(name);
    if root.exists() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} already exists", root.display()),
        ));
    }

    let src_dir = root.join("src").join(name.replace('-', "_"));
    let test_dir = root.join("test");
    fs::create_dir_all(&src_dir)?;
    fs::create_dir_all(&test_dir)?;

    let ns = format!("{}.core", name.replace('-', "_"));
    let main_body = match template {
        "app" => format!(
            "(ns {})\n\n(defn -main [& args]\n  (println \"Hello from {}!\"))\n\n(-main)\n",
            ns, name
        ),
        _ => format!(
            "(ns {})\n\n(defn greeting [who]\n  (str \"Hello, \" who \"!\"))\n",
            ns
        ),
    };
    fs::write(src_dir.join("core.sbl"), main_body)?;

    let test_body = format!(
        "(ns {}-test\n  (:require [sable.test :refer [deftest is]]))\n\n(deftest smoke-test\n  (is (= 2 (+ 1 1))))\n",
        name.replace('-', "_")
    );
    fs::write(test_dir.join("core_test.sbl"), test_body)?;

    let readme = format!(
        "# {}\n\nRun:\n\n    sable src/{}/core.sbl\n\nTest:\n\n    sable test test\n",
        name,
        name.replace('-', "_")
    );
    fs::write(root.join("README.md"), readme)?;

    println!("Created {} project at {}", template, root.display());
    println!("  src/{}/core.sbl", name.replace('-', "_"));
    println!("  test/core_test.sbl");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_unknown_template_and_bad_names() {
        assert!(generate("tui", "x").is_err());
        assert!(generate("app", "bad name").is_err());
        assert!(generate("app", "").is_err());
    }

    #[test]
    fn test_generates_app_layout() {
        let dir = tempfile::tempdir().unwrap();
        let old = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();
        let result = generate("app", "demo-app");
        std::env::set_current_dir(old).unwrap();
        result.unwrap();
        assert!(dir.path().join("demo-app/src/demo_app/core.sbl").exists());
        assert!(dir.path().join("demo-app/test/core_test.sbl").exists());
    }
}
