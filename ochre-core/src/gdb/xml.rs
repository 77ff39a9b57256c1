//! Target-description and memory-map documents served over qXfer.

use crate::board;
use crate::core::csr::{self, CsrKind};
use std::sync::OnceLock;

/// Top-level target description; the debugger fetches the included annexes
/// separately.
pub const TARGET_XML: &str = r#"<?xml version="1.0"?>
<!DOCTYPE target SYSTEM "gdb-target.dtd">
<target version="1.0">
  <architecture>riscv:rv32</architecture>
  <xi:include href="riscv-32bit-cpu.xml"/>
  <xi:include href="riscv-32bit-csr-generated.xml"/>
</target>
"#;

/// The base CPU feature: 32 GPRs plus the PC, in debugger numbering.
pub const CPU_XML: &str = r#"<?xml version="1.0"?>
<!DOCTYPE feature SYSTEM "gdb-target.dtd">
<feature name="org.gnu.gdb.riscv.cpu">
  <reg name="zero" bitsize="32" type="int" regnum="0"/>
  <reg name="ra" bitsize="32" type="code_ptr"/>
  <reg name="sp" bitsize="32" type="data_ptr"/>
  <reg name="gp" bitsize="32" type="data_ptr"/>
  <reg name="tp" bitsize="32" type="data_ptr"/>
  <reg name="t0" bitsize="32" type="int"/>
  <reg name="t1" bitsize="32" type="int"/>
  <reg name="t2" bitsize="32" type="int"/>
  <reg name="s0" bitsize="32" type="int"/>
  <reg name="s1" bitsize="32" type="int"/>
  <reg name="a0" bitsize="32" type="int"/>
  <reg name="a1" bitsize="32" type="int"/>
  <reg name="a2" bitsize="32" type="int"/>
  <reg name="a3" bitsize="32" type="int"/>
  <reg name="a4" bitsize="32" type="int"/>
  <reg name="a5" bitsize="32" type="int"/>
  <reg name="a6" bitsize="32" type="int"/>
  <reg name="a7" bitsize="32" type="int"/>
  <reg name="s2" bitsize="32" type="int"/>
  <reg name="s3" bitsize="32" type="int"/>
  <reg name="s4" bitsize="32" type="int"/>
  <reg name="s5" bitsize="32" type="int"/>
  <reg name="s6" bitsize="32" type="int"/>
  <reg name="s7" bitsize="32" type="int"/>
  <reg name="s8" bitsize="32" type="int"/>
  <reg name="s9" bitsize="32" type="int"/>
  <reg name="s10" bitsize="32" type="int"/>
  <reg name="s11" bitsize="32" type="int"/>
  <reg name="t3" bitsize="32" type="int"/>
  <reg name="t4" bitsize="32" type="int"/>
  <reg name="t5" bitsize="32" type="int"/>
  <reg name="t6" bitsize="32" type="int"/>
  <reg name="pc" bitsize="32" type="code_ptr"/>
</feature>
"#;

static MEMORY_MAP_XML: OnceLock<String> = OnceLock::new();

/// The qXfer memory map matching the fixed platform layout.
fn memory_map_xml() -> &'static str {
    MEMORY_MAP_XML.get_or_init(|| {
        format!(
            r#"<?xml version="1.0"?>
<!DOCTYPE memory-map PUBLIC "+//IDN gnu.org//DTD GDB Memory Map V1.0//EN" "http://sourceware.org/gdb/gdb-memory-map.dtd">
<memory-map>
  <memory type="rom" start="{rom:#x}" length="{rom_len:#x}"/>
  <memory type="ram" start="{ram:#x}" length="{ram_len:#x}"/>
  <memory type="ram" start="{uart:#x}" length="0x100"/>
  <memory type="ram" start="{clock:#x}" length="0x100"/>
</memory-map>
"#,
            rom = board::ROM_BASE,
            rom_len = board::ROM_SIZE,
            ram = board::RAM_BASE,
            ram_len = board::RAM_SIZE,
            uart = board::UART_BASE,
            clock = board::CLOCK_BASE,
        )
    })
}

static CSR_XML: OnceLock<String> = OnceLock::new();

/// The CSR feature, generated from the CSR metadata table. Debugger
/// register numbers are the CSR address plus 128.
fn csr_xml() -> &'static str {
    CSR_XML.get_or_init(|| {
        let mut registers = String::new();
        for meta in csr::METADATA {
            let kind = match meta.kind {
                CsrKind::Int => "int",
                CsrKind::DataPtr => "data_ptr",
                CsrKind::CodePtr => "code_ptr",
            };
            registers.push_str(&format!(
                "<reg name=\"{}\" bitsize=\"32\" type=\"{}\" regnum=\"{}\"/>\n",
                meta.name,
                kind,
                u32::from(meta.address) + 128,
            ));
        }
        format!(
            "<?xml version=\"1.0\"?>\
             <!DOCTYPE feature SYSTEM \"gdb-target.dtd\">\
             <feature name=\"org.gnu.gdb.riscv.csr\">\n{registers}</feature>\n"
        )
    })
}

/// One slice of an annex, as requested by a qXfer read.
pub struct XmlSlice {
    /// `true` when the slice reaches the end of the document.
    pub is_end: bool,
    pub data: Vec<u8>,
}

/// Cuts `offset..offset+length` out of the named annex. `None` for an
/// unknown annex name.
pub fn annex_slice(annex: &str, offset: u32, length: u32) -> Option<XmlSlice> {
    let document: &[u8] = match annex {
        "target.xml" => TARGET_XML.as_bytes(),
        "riscv-32bit-cpu.xml" => CPU_XML.as_bytes(),
        "riscv-32bit-csr-generated.xml" => csr_xml().as_bytes(),
        _ => return None,
    };
    Some(slice_document(document, offset, length))
}

/// Cuts a slice out of the memory-map document.
pub fn memory_map_slice(offset: u32, length: u32) -> XmlSlice {
    slice_document(memory_map_xml().as_bytes(), offset, length)
}

fn slice_document(document: &[u8], offset: u32, length: u32) -> XmlSlice {
    let start = (offset as usize).min(document.len());
    let end = start.saturating_add(length as usize).min(document.len());
    XmlSlice {
        is_end: offset as u64 + length as u64 >= document.len() as u64,
        data: document[start..end].to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annex_lookup() {
        assert!(annex_slice("target.xml", 0, 1024).is_some());
        assert!(annex_slice("riscv-32bit-cpu.xml", 0, 1024).is_some());
        assert!(annex_slice("riscv-32bit-csr-generated.xml", 0, 1024).is_some());
        assert!(annex_slice("no-such.xml", 0, 1024).is_none());
    }

    #[test]
    fn slicing_reports_completion() {
        let first = annex_slice("target.xml", 0, 16).unwrap();
        assert!(!first.is_end);
        assert_eq!(16, first.data.len());
        assert!(first.data.starts_with(b"<?xml"));

        let rest = annex_slice("target.xml", 16, 1 << 20).unwrap();
        assert!(rest.is_end);
        assert_eq!(TARGET_XML.len() - 16, rest.data.len());

        let past = annex_slice("target.xml", 1 << 20, 16).unwrap();
        assert!(past.is_end);
        assert!(past.data.is_empty());
    }

    #[test]
    fn csr_feature_lists_every_metadata_entry() {
        let slice = annex_slice("riscv-32bit-csr-generated.xml", 0, 1 << 20).unwrap();
        let text = String::from_utf8(slice.data).unwrap();
        for meta in csr::METADATA {
            assert!(text.contains(meta.name), "{} missing", meta.name);
        }
        // Spot-check the regno offset.
        assert!(text.contains("regnum=\"896\"")); // mstatus at 0x300 + 128
    }

    #[test]
    fn memory_map_names_all_regions() {
        let slice = memory_map_slice(0, 1 << 20);
        let text = String::from_utf8(slice.data).unwrap();
        assert!(text.contains("0x100000"));
        assert!(text.contains("0x80000000"));
        assert!(text.contains("0x10000"));
        assert!(text.contains("0x11000"));
    }

    #[test]
    fn cpu_feature_matches_register_names() {
        for specifier in crate::registers::Specifier::iter_all() {
            assert!(CPU_XML.contains(&format!("\"{}\"", specifier.abi_name())));
        }
    }
}
