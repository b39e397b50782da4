//! ASCII serialization of patches and seed points.
//!
//! A patch file starts with `PATCHES` and a count, followed by one record
//! per patch:
//!
//! ```text
//! PATCHS
//! <x> <y> <z> <w>
//! <nx> <ny> <nz> <nw>
//! <ncc> <dscale> <ascale>
//! <n_images>
//! i0 i1 ...
//! <n_vimages>
//! v0 v1 ...
//! ```
//!
//! The legacy `PATCHA` header is accepted on read; its extra type and
//! direction fields are parsed and discarded. Seed features use `POINT0`
//! records of `u v response type`.

use std::io::{BufRead, Write};

use anyhow::{bail, Context, Result};
use nalgebra::{Vector3, Vector4};

use super::{Patch, PatchStatus};

/// A sparse seed feature in image coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct Point {
    /// Image coordinates, homogeneous with `z = 1`.
    pub icoord: Vector3<f32>,
    /// Detector response.
    pub response: f32,
    /// Detector type tag.
    pub ptype: i32,
}

struct Tokens<'a> {
    iter: std::str::SplitWhitespace<'a>,
}

impl<'a> Tokens<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            iter: text.split_whitespace(),
        }
    }

    fn next(&mut self) -> Result<&'a str> {
        self.iter.next().context("unexpected end of input")
    }

    fn f32(&mut self) -> Result<f32> {
        let tok = self.next()?;
        tok.parse().with_context(|| format!("bad float {tok:?}"))
    }

    fn i32(&mut self) -> Result<i32> {
        let tok = self.next()?;
        tok.parse().with_context(|| format!("bad integer {tok:?}"))
    }

    fn usize(&mut self) -> Result<usize> {
        let tok = self.next()?;
        tok.parse().with_context(|| format!("bad index {tok:?}"))
    }
}

/// Write a patch collection.
pub fn write_patches<W: Write>(mut w: W, patches: &[&Patch]) -> Result<()> {
    writeln!(w, "PATCHES")?;
    writeln!(w, "{}", patches.len())?;
    writeln!(w)?;
    for patch in patches {
        write_patch(&mut w, patch)?;
        writeln!(w)?;
    }
    Ok(())
}

fn write_patch<W: Write>(w: &mut W, patch: &Patch) -> Result<()> {
    writeln!(w, "PATCHS")?;
    let c = patch.coord;
    writeln!(w, "{} {} {} {}", c.x, c.y, c.z, c.w)?;
    let n = patch.normal;
    writeln!(w, "{} {} {} {}", n.x, n.y, n.z, n.w)?;
    writeln!(w, "{} {} {}", patch.ncc, patch.dscale, patch.ascale)?;
    writeln!(w, "{}", patch.images.len())?;
    let images: Vec<String> = patch.images.iter().map(|i| i.to_string()).collect();
    writeln!(w, "{}", images.join(" "))?;
    writeln!(w, "{}", patch.vimages.len())?;
    let vimages: Vec<String> = patch.vimages.iter().map(|i| i.to_string()).collect();
    writeln!(w, "{}", vimages.join(" "))?;
    Ok(())
}

/// Read a patch collection written by [`write_patches`].
pub fn read_patches<R: BufRead>(mut r: R) -> Result<Vec<Patch>> {
    let mut text = String::new();
    r.read_to_string(&mut text)?;
    let mut tokens = Tokens::new(&text);

    let header = tokens.next()?;
    if header != "PATCHES" {
        bail!("expected PATCHES header, got {header:?}");
    }
    let count = tokens.usize()?;
    let mut patches = Vec::with_capacity(count);
    for _ in 0..count {
        patches.push(read_patch(&mut tokens)?);
    }
    Ok(patches)
}

fn read_patch(tokens: &mut Tokens) -> Result<Patch> {
    let header = tokens.next()?;
    if header != "PATCHS" && header != "PATCHA" {
        bail!("expected PATCHS record, got {header:?}");
    }

    let coord = Vector4::new(tokens.f32()?, tokens.f32()?, tokens.f32()?, tokens.f32()?);
    let normal = Vector4::new(tokens.f32()?, tokens.f32()?, tokens.f32()?, tokens.f32()?);
    let ncc = tokens.f32()?;
    let dscale = tokens.f32()?;
    let ascale = tokens.f32()?;

    if header == "PATCHA" {
        // Legacy records carry a type and a direction vector.
        let _ptype = tokens.i32()?;
        for _ in 0..4 {
            let _ = tokens.f32()?;
        }
    }

    let nimages = tokens.usize()?;
    let mut images = Vec::with_capacity(nimages);
    for _ in 0..nimages {
        images.push(tokens.usize()?);
    }
    let nvimages = tokens.usize()?;
    let mut vimages = Vec::with_capacity(nvimages);
    for _ in 0..nvimages {
        vimages.push(tokens.usize()?);
    }

    let mut patch = Patch::seed(coord, normal, images);
    patch.ncc = ncc;
    patch.dscale = dscale;
    patch.ascale = ascale;
    patch.vimages = vimages;
    patch.status = PatchStatus::Accepted;
    Ok(patch)
}

/// Write seed features as `POINT0` records.
pub fn write_points<W: Write>(mut w: W, points: &[Point]) -> Result<()> {
    for p in points {
        writeln!(w, "POINT0")?;
        writeln!(w, "{} {} {} {}", p.icoord.x, p.icoord.y, p.response, p.ptype)?;
    }
    Ok(())
}

/// Read `POINT0` records until the input is exhausted.
pub fn read_points<R: BufRead>(mut r: R) -> Result<Vec<Point>> {
    let mut text = String::new();
    r.read_to_string(&mut text)?;
    let mut tokens = Tokens::new(&text);
    let mut points = Vec::new();
    while let Ok(header) = tokens.next() {
        if header != "POINT0" {
            bail!("expected POINT0 record, got {header:?}");
        }
        let u = tokens.f32()?;
        let v = tokens.f32()?;
        points.push(Point {
            icoord: Vector3::new(u, v, 1.0),
            response: tokens.f32()?,
            ptype: tokens.i32()?,
        });
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_patch() -> Patch {
        let mut p = Patch::seed(
            Vector4::new(1.0, -2.5, 0.25, 1.0),
            Vector4::new(0.0, 0.6, -0.8, 0.0),
            vec![2, 0, 5],
        );
        p.ncc = 0.91;
        p.dscale = 0.015;
        p.ascale = 0.065;
        p.vimages = vec![3];
        p
    }

    #[test]
    fn patch_roundtrip() {
        let patch = sample_patch();
        let mut buf = Vec::new();
        write_patches(&mut buf, &[&patch]).unwrap();

        let read = read_patches(buf.as_slice()).unwrap();
        assert_eq!(read.len(), 1);
        let r = &read[0];
        assert!((r.coord - patch.coord).norm() < 1e-6);
        assert!((r.normal - patch.normal).norm() < 1e-6);
        assert!((r.ncc - patch.ncc).abs() < 1e-6);
        assert_eq!(r.images, patch.images);
        assert_eq!(r.vimages, patch.vimages);
    }

    #[test]
    fn legacy_patcha_record_is_accepted() {
        let text = "PATCHES\n1\n\nPATCHA\n\
                    0 0 1 1\n0 0 1 0\n0.8 0.01 0.05\n\
                    1 0.5 0.5 0 0\n\
                    2\n0 1\n0\n\n";
        let read = read_patches(text.as_bytes()).unwrap();
        assert_eq!(read[0].images, vec![0, 1]);
        assert!((read[0].ncc - 0.8).abs() < 1e-6);
        assert!(read[0].vimages.is_empty());
    }

    #[test]
    fn point_roundtrip() {
        let points = vec![
            Point {
                icoord: Vector3::new(10.5, 20.25, 1.0),
                response: 0.75,
                ptype: 1,
            },
            Point {
                icoord: Vector3::new(3.0, 4.0, 1.0),
                response: 0.1,
                ptype: 0,
            },
        ];
        let mut buf = Vec::new();
        write_points(&mut buf, &points).unwrap();
        let read = read_points(buf.as_slice()).unwrap();
        assert_eq!(read, points);
    }
}
