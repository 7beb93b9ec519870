extern crate bindgen;

use std::collections::HashSet;
use std::env;
use std::fmt::Write;
use std::fs;
use std::path::PathBuf;

/// Finds `nvEncodeAPI.h`, either in the Video Codec SDK or in FFmpeg's nv-codec-headers.
fn include_dir() -> PathBuf {
    println!("cargo:rerun-if-env-changed=NVENC_INCLUDE_DIR");
    println!("cargo:rerun-if-env-changed=NVIDIA_VIDEO_CODEC_SDK_PATH");

    let mut candidates = Vec::new();
    if let Some(dir) = env::var_os("NVENC_INCLUDE_DIR") {
        candidates.push(PathBuf::from(dir));
    }
    if let Some(sdk) = env::var_os("NVIDIA_VIDEO_CODEC_SDK_PATH") {
        candidates.push(PathBuf::from(sdk).join("Interface"));
    }
    candidates.push(PathBuf::from("/usr/include/ffnvcodec"));
    candidates.push(PathBuf::from("/usr/local/include/ffnvcodec"));

    candidates
        .into_iter()
        .find(|dir| dir.join("nvEncodeAPI.h").is_file())
        .expect("unable to find nvEncodeAPI.h, set NVENC_INCLUDE_DIR or NVIDIA_VIDEO_CODEC_SDK_PATH")
}

/// Struct versions are function-like macros, which bindgen skips:
///
/// `#define NV_ENC_PIC_PARAMS_VER (NVENCAPI_STRUCT_VERSION(6) | ( 1<<31 ))`
fn struct_versions(header: &str, out: &mut String) {
    let mut seen = HashSet::new();
    for line in header.lines() {
        let line = line.split("//").next().unwrap_or_default();
        let mut tokens = line.split_whitespace();
        if tokens.next() != Some("#define") {
            continue;
        }
        let Some(name) = tokens.next() else { continue };
        if !name.ends_with("_VER") || !seen.insert(name.to_string()) {
            continue;
        }
        let value = tokens.collect::<String>();
        let Some(version) = value
            .split("NVENCAPI_STRUCT_VERSION(")
            .nth(1)
            .and_then(|rest| rest.split(')').next())
            .and_then(|version| version.parse::<u32>().ok())
        else {
            continue;
        };
        let high_bit = ["1<<31", "1u<<31", "1U<<31"].iter().any(|bit| value.contains(bit));
        writeln!(
            out,
            "pub const {name}: u32 = NVENCAPI_STRUCT_VERSION({version}){};",
            if high_bit { " | (1 << 31)" } else { "" }
        )
        .unwrap();
    }
}

/// GUIDs are static variables with internal linkage, which bindgen would turn into unresolvable
/// externs:
///
/// `static const GUID NV_ENC_CODEC_H264_GUID = { 0x6bc82762, 0x4e63, 0x4ca4, { 0xaa, ... } };`
fn guids(header: &str, out: &mut String) {
    for definition in header.split("static const GUID").skip(1) {
        let Some((name, rest)) = definition.split_once('=') else { continue };
        let Some((initializer, _)) = rest.split_once(';') else { continue };
        let values = initializer
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter_map(|token| token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")))
            .filter_map(|hex| u32::from_str_radix(hex.trim_end_matches(['u', 'U', 'l', 'L']), 16).ok())
            .collect::<Vec<_>>();
        let [data1, data2, data3, data4 @ ..] = values.as_slice() else { continue };
        if data4.len() != 8 {
            continue;
        }
        let data4 = data4.iter().map(|b| format!("{b:#04x}")).collect::<Vec<_>>().join(", ");
        writeln!(
            out,
            "pub const {}: GUID = GUID {{ Data1: {data1:#x}, Data2: {data2:#x}, Data3: {data3:#x}, Data4: [{data4}] }};",
            name.trim()
        )
        .unwrap();
    }
}

fn main() {
    let include_dir = include_dir();
    let header_path = include_dir.join("nvEncodeAPI.h");
    println!("cargo:rerun-if-changed=src/lib.h");
    println!("cargo:rerun-if-changed={}", header_path.display());

    let bindings = bindgen::Builder::default()
        .clang_arg(format!("-I{}", include_dir.display()))
        .header("src/lib.h")
        .allowlist_item("NV.*")
        .allowlist_function("NvEncodeAPI.*")
        .blocklist_item("NV_ENC_.*_GUID")
        .blocklist_item("NV.*_VER")
        .blocklist_item("NVENCAPI_VERSION")
        .prepend_enum_name(false)
        .derive_default(true)
        .dynamic_library_name("nvenc_api")
        .dynamic_link_require_all(true)
        .generate()
        .expect("unable to generate bindings");

    let out_path = PathBuf::from(env::var("OUT_DIR").unwrap());
    bindings.write_to_file(out_path.join("bindings.rs")).expect("unable to write bindings");

    let header = fs::read_to_string(&header_path).expect("unable to read nvEncodeAPI.h");
    let mut constants = String::new();
    struct_versions(&header, &mut constants);
    guids(&header, &mut constants);
    fs::write(out_path.join("constants.rs"), constants).expect("unable to write constants");
}
