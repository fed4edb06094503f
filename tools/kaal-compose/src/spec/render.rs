//! capDL-style textual rendering of a [`Spec`]

use core::fmt::{self, Display, Formatter};

use super::{Cap, CapEntry, Object, Rights, Spec};

impl Display for Spec {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "arch {}", self.arch.name())?;
        writeln!(f)?;

        writeln!(f, "objects {{")?;
        for named in &self.objects {
            write!(f, "    {} = ", named.name)?;
            self.fmt_object(f, &named.object)?;
            writeln!(f)?;
        }
        writeln!(f, "}}")?;
        writeln!(f)?;

        writeln!(f, "caps {{")?;
        for named in &self.objects {
            let slots = self.cap_lines(&named.object);
            if slots.is_empty() {
                continue;
            }
            writeln!(f, "    {} {{", named.name)?;
            for line in slots {
                writeln!(f, "        {}", line)?;
            }
            writeln!(f, "    }}")?;
        }
        writeln!(f, "}}")?;

        if !self.irqs.is_empty() {
            writeln!(f)?;
            writeln!(f, "irq maps {{")?;
            for entry in &self.irqs {
                writeln!(f, "    {}: {}", entry.irq, self.name_of(entry.handler))?;
            }
            writeln!(f, "}}")?;
        }

        if !self.asid_slots.is_empty() {
            writeln!(f)?;
            writeln!(f, "asid slots {{")?;
            for &pool in &self.asid_slots {
                if let Object::AsidPool { high: Some(high) } = self.object(pool).object {
                    writeln!(f, "    {:#x}: {}", high, self.name_of(pool))?;
                }
            }
            writeln!(f, "}}")?;
        }

        if !self.untyped_covers.is_empty() {
            writeln!(f)?;
            writeln!(f, "untyped covers {{")?;
            for cover in &self.untyped_covers {
                writeln!(f, "    {} {{", self.name_of(cover.parent))?;
                for child in &cover.children {
                    writeln!(f, "        {:#x}: {}", child.paddr, self.name_of(child.object))?;
                }
                writeln!(f, "    }}")?;
            }
            writeln!(f, "}}")?;
        }

        Ok(())
    }
}

impl Spec {
    fn fmt_object(&self, f: &mut Formatter<'_>, object: &Object) -> fmt::Result {
        match object {
            Object::Untyped {
                size_bits,
                paddr,
                device,
            } => {
                write!(f, "ut ({} bits", size_bits)?;
                if let Some(paddr) = paddr {
                    write!(f, ", paddr: {:#x}", paddr)?;
                }
                if *device {
                    write!(f, ", device")?;
                }
                write!(f, ")")
            }
            Object::CNode { size_bits, .. } => match size_bits {
                Some(bits) => write!(f, "cnode ({} bits)", bits),
                None => write!(f, "cnode (unsized)"),
            },
            Object::Tcb(tcb) => {
                write!(
                    f,
                    "tcb (addr: {:#x}, ip: {:#x}, sp: {:#x}, prio: {}, max_prio: {}, affinity: {}, resume: {}",
                    tcb.ipc_buffer_addr, tcb.ip, tcb.sp, tcb.prio, tcb.max_prio, tcb.affinity, tcb.resume
                )?;
                if !tcb.gprs.is_empty() {
                    let init = tcb
                        .gprs
                        .iter()
                        .map(|r| format!("{:#x}", r))
                        .collect::<Vec<_>>()
                        .join(", ");
                    write!(f, ", init: [{}]", init)?;
                }
                write!(f, ")")
            }
            Object::Irq { irq, .. } => write!(f, "irq (number: {})", irq),
            Object::Frame(frame) => {
                write!(f, "frame ({:#x}", 1u64 << frame.size_bits)?;
                if let Some(paddr) = frame.paddr {
                    write!(f, ", paddr: {:#x}", paddr)?;
                }
                if frame.device {
                    write!(f, ", device")?;
                }
                if !frame.fill.is_empty() {
                    write!(f, ", fill: [")?;
                    for (i, entry) in frame.fill.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(
                            f,
                            "{{{} {} {} {}}}",
                            entry.offset, entry.length, entry.file, entry.file_offset
                        )?;
                    }
                    write!(f, "]")?;
                }
                write!(f, ")")
            }
            Object::PageTable { level, is_root, .. } => {
                if *is_root {
                    write!(f, "pt (root, level: {})", level)
                } else {
                    write!(f, "pt (level: {})", level)
                }
            }
            Object::AsidPool { high } => match high {
                Some(high) => write!(f, "asid_pool (asid_high: {:#x})", high),
                None => write!(f, "asid_pool"),
            },
            Object::SchedContext {
                size_bits,
                period,
                budget,
            } => write!(
                f,
                "sc ({} bits, period: {}, budget: {})",
                size_bits, period, budget
            ),
            Object::Endpoint | Object::Notification | Object::Reply => {
                write!(f, "{}", object.kind())
            }
        }
    }

    fn cap_lines(&self, object: &Object) -> Vec<String> {
        let mut lines = Vec::new();
        let mut named = |slot: &str, cap: &Option<Cap>| {
            if let Some(cap) = cap {
                lines.push(format!("{}: {}", slot, self.fmt_cap(cap)));
            }
        };

        match object {
            Object::Tcb(tcb) => {
                named("cspace", &tcb.cspace);
                named("vspace", &tcb.vspace);
                named("ipc_buffer_slot", &tcb.ipc_buffer);
                named("sc_slot", &tcb.sched_context);
            }
            Object::Irq { notification, .. } => named("notification", notification),
            Object::CNode { slots, .. } | Object::PageTable { slots, .. } => {
                lines.extend(slots.iter().map(|CapEntry { slot, cap }| {
                    format!("{:#x}: {}", slot, self.fmt_cap(cap))
                }));
            }
            _ => {}
        }
        lines
    }

    fn fmt_cap(&self, cap: &Cap) -> String {
        let mut s = self.name_of(cap.object).to_string();
        let mut attrs = Vec::new();

        if cap.rights != Rights::all() {
            attrs.push(rights_str(cap.rights));
        }
        if cap.badge != 0 {
            attrs.push(format!("badge: {}", cap.badge));
        }
        if let Some(guard_size) = cap.guard_size {
            attrs.push(format!("guard: 0, guard_size: {}", guard_size));
        }
        if !cap.cached {
            attrs.push("uncached".to_string());
        }
        if cap.executable {
            attrs.push("X".to_string());
        }

        if !attrs.is_empty() {
            s.push_str(&format!(" ({})", attrs.join(", ")));
        }
        s
    }
}

/// `RWGP` letters, `-` for no rights
fn rights_str(rights: Rights) -> String {
    if rights.is_empty() {
        return "-".to_string();
    }
    let mut s = String::new();
    if rights.contains(Rights::READ) {
        s.push('R');
    }
    if rights.contains(Rights::WRITE) {
        s.push('W');
    }
    if rights.contains(Rights::GRANT) {
        s.push('G');
    }
    if rights.contains(Rights::GRANT_REPLY) {
        s.push('P');
    }
    s
}

#[cfg(test)]
mod tests {
    use crate::kernel_config::Arch;
    use crate::spec::{Cap, CapEntry, Object, ObjectSpace, Rights};

    #[test]
    fn test_render_cnode_slots() {
        let mut objects = ObjectSpace::new(Arch::Aarch64);
        let ntfn = objects.alloc("c_lock", None, Object::Notification).unwrap();
        objects
            .alloc(
                "c_cspace",
                None,
                Object::CNode {
                    size_bits: Some(4),
                    slots: vec![CapEntry {
                        slot: 1,
                        cap: Cap::new(ntfn).with_rights(Rights::RW).with_badge(1),
                    }],
                },
            )
            .unwrap();

        let text = objects.spec().to_string();
        assert!(text.starts_with("arch aarch64\n"));
        assert!(text.contains("c_cspace = cnode (4 bits)"));
        assert!(text.contains("0x1: c_lock (RW, badge: 1)"));
    }

    #[test]
    fn test_render_empty_rights() {
        let mut objects = ObjectSpace::new(Arch::Aarch64);
        let text_page = objects.alloc("c_text", None, Object::frame(12)).unwrap();
        let data_page = objects.alloc("c_data", None, Object::frame(12)).unwrap();
        objects
            .alloc(
                "c_pt",
                None,
                Object::PageTable {
                    level: 3,
                    is_root: false,
                    slots: vec![
                        CapEntry {
                            slot: 0,
                            cap: Cap::new(text_page)
                                .with_rights(Rights::empty())
                                .with_executable(true),
                        },
                        CapEntry {
                            slot: 1,
                            cap: Cap::new(data_page),
                        },
                    ],
                },
            )
            .unwrap();

        let text = objects.spec().to_string();
        assert!(text.contains("0x0: c_text (-, X)"));
        assert!(text.contains("0x1: c_data\n"));
    }
}
